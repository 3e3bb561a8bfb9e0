use super::*;

impl PostgresDeploymentRepository {
    pub(super) async fn find_target_impl(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Option<Target>> {
        let mut connection = self.pool.acquire().await.map_err(|error| {
            AppError::Internal(format!("failed to acquire connection: {error}"))
        })?;

        find_target_in(&mut connection, tenant_id, controller_id).await
    }

    pub(super) async fn create_target_impl(
        &self,
        tenant_id: TenantId,
        mut target: Target,
    ) -> AppResult<Target> {
        let mut transaction = self.begin().await?;
        upsert_target_type(&mut transaction, tenant_id, target.target_type()).await?;

        sqlx::query(
            r#"
            INSERT INTO targets (
                tenant_id,
                controller_id,
                name,
                description,
                address,
                update_status,
                last_poll_at,
                last_installation_at,
                attributes,
                metadata,
                tags,
                request_attributes,
                assigned_distribution_set_id,
                installed_distribution_set_id,
                target_type_key,
                created_at,
                version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 1)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(target.controller_id().as_str())
        .bind(target.name())
        .bind(target.description())
        .bind(target.address())
        .bind(target.update_status().as_str())
        .bind(target.last_poll_at())
        .bind(target.last_installation_at())
        .bind(Json(target.attributes()))
        .bind(Json(target.metadata()))
        .bind(target.tags().iter().cloned().collect::<Vec<_>>())
        .bind(target.request_attributes())
        .bind(target.assigned_distribution_set().map(|id| id.value()))
        .bind(target.installed_distribution_set().map(|id| id.value()))
        .bind(target.target_type().map(TargetType::key))
        .bind(target.created_at())
        .execute(&mut *transaction)
        .await
        .map_err(|error| {
            map_database_error(
                &format!(
                    "failed to create target '{}' for tenant '{tenant_id}'",
                    target.controller_id()
                ),
                error,
            )
        })?;

        commit(transaction).await?;
        target.set_version(1);
        Ok(target)
    }

    pub(super) async fn touch_last_poll_impl(
        &self,
        tenant_id: TenantId,
        controller_ids: &[ControllerId],
        polled_at: DateTime<Utc>,
    ) -> AppResult<u64> {
        if controller_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = controller_ids
            .iter()
            .map(|controller_id| controller_id.as_str().to_owned())
            .collect();
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET last_poll_at = $3
            WHERE tenant_id = $1 AND controller_id = ANY($2)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(ids)
        .bind(polled_at)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to record last poll for tenant '{tenant_id}'"),
                error,
            )
        })?;

        Ok(result.rows_affected())
    }

    pub(super) async fn mark_request_attributes_impl(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET request_attributes = true
            WHERE tenant_id = $1 AND controller_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(controller_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to flag target '{controller_id}' for attribute request"),
                error,
            )
        })?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "target '{controller_id}' does not exist for tenant '{tenant_id}'"
            )));
        }

        Ok(())
    }

    pub(super) async fn list_auto_assign_candidates_impl(
        &self,
        tenant_id: TenantId,
        query: CandidatePageQuery,
    ) -> AppResult<Vec<Target>> {
        let sql = format!(
            r#"
            {TARGET_SELECT}
            WHERE t.tenant_id = $1
                AND ($2::TEXT IS NULL OR t.controller_id > $2)
                AND t.assigned_distribution_set_id IS DISTINCT FROM $3
                AND NOT EXISTS (
                    SELECT 1
                    FROM actions a
                    WHERE a.tenant_id = t.tenant_id
                        AND a.controller_id = t.controller_id
                        AND a.distribution_set_id = $3
                )
            ORDER BY t.controller_id
            LIMIT $4
            "#
        );

        let rows = sqlx::query_as::<_, TargetRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(query.after.as_ref().map(ControllerId::as_str))
            .bind(query.distribution_set_id.value())
            .bind(limit_param(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                map_database_error(
                    &format!("failed to list auto assign candidates for tenant '{tenant_id}'"),
                    error,
                )
            })?;

        rows.into_iter().map(target_from_row).collect()
    }
}

pub(super) async fn find_target_in(
    connection: &mut PgConnection,
    tenant_id: TenantId,
    controller_id: &ControllerId,
) -> AppResult<Option<Target>> {
    let sql = format!("{TARGET_SELECT} WHERE t.tenant_id = $1 AND t.controller_id = $2");

    let row = sqlx::query_as::<_, TargetRow>(&sql)
        .bind(tenant_id.as_uuid())
        .bind(controller_id.as_str())
        .fetch_optional(&mut *connection)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to load target '{controller_id}' for tenant '{tenant_id}'"),
                error,
            )
        })?;

    row.map(target_from_row).transpose()
}

/// Writes a target guarded by its loaded version and returns it with the
/// bumped version.
pub(super) async fn update_target_in(
    connection: &mut PgConnection,
    tenant_id: TenantId,
    mut target: Target,
) -> AppResult<Target> {
    upsert_target_type(connection, tenant_id, target.target_type()).await?;

    let written = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>, bool)>(
        r#"
        UPDATE targets
        SET
            name = $3,
            description = $4,
            address = $5,
            update_status = $6,
            last_poll_at = GREATEST(last_poll_at, $7),
            last_installation_at = $8,
            attributes = $9,
            metadata = $10,
            tags = $11,
            request_attributes = CASE WHEN $17 THEN $12 ELSE request_attributes OR $12 END,
            assigned_distribution_set_id = $13,
            installed_distribution_set_id = $14,
            target_type_key = $15,
            version = version + 1
        WHERE tenant_id = $1 AND controller_id = $2 AND version = $16
        RETURNING version, last_poll_at, request_attributes
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(target.controller_id().as_str())
    .bind(target.name())
    .bind(target.description())
    .bind(target.address())
    .bind(target.update_status().as_str())
    .bind(target.last_poll_at())
    .bind(target.last_installation_at())
    .bind(Json(target.attributes()))
    .bind(Json(target.metadata()))
    .bind(target.tags().iter().cloned().collect::<Vec<_>>())
    .bind(target.request_attributes())
    .bind(target.assigned_distribution_set().map(|id| id.value()))
    .bind(target.installed_distribution_set().map(|id| id.value()))
    .bind(target.target_type().map(TargetType::key))
    .bind(target.version())
    .bind(target.attributes_reported())
    .fetch_optional(&mut *connection)
    .await
    .map_err(|error| {
        map_database_error(
            &format!(
                "failed to update target '{}' for tenant '{tenant_id}'",
                target.controller_id()
            ),
            error,
        )
    })?;

    match written {
        Some((version, last_poll_at, request_attributes)) => {
            target.merge_stored_signals(last_poll_at, request_attributes);
            target.set_version(version);
            Ok(target)
        }
        None => {
            let exists = find_target_in(connection, tenant_id, target.controller_id())
                .await?
                .is_some();
            if exists {
                Err(AppError::ConcurrencyConflict(format!(
                    "target '{}' was modified concurrently",
                    target.controller_id()
                )))
            } else {
                Err(AppError::NotFound(format!(
                    "target '{}' does not exist for tenant '{tenant_id}'",
                    target.controller_id()
                )))
            }
        }
    }
}

async fn upsert_target_type(
    connection: &mut PgConnection,
    tenant_id: TenantId,
    target_type: Option<&TargetType>,
) -> AppResult<()> {
    let Some(target_type) = target_type else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO target_types (tenant_id, type_key, compatible_set_types)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, type_key)
        DO UPDATE SET compatible_set_types = EXCLUDED.compatible_set_types
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(target_type.key())
    .bind(
        target_type
            .compatible_set_types()
            .iter()
            .cloned()
            .collect::<Vec<_>>(),
    )
    .execute(&mut *connection)
    .await
    .map_err(|error| {
        map_database_error(
            &format!(
                "failed to save target type '{}' for tenant '{tenant_id}'",
                target_type.key()
            ),
            error,
        )
    })?;

    Ok(())
}

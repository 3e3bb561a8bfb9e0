use super::*;

impl PostgresDeploymentRepository {
    pub(super) async fn find_action_impl(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<Action>> {
        let sql = format!("{ACTION_SELECT} WHERE tenant_id = $1 AND id = $2");

        let row = sqlx::query_as::<_, ActionRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(action_id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| {
                map_database_error(
                    &format!("failed to load action '{action_id}' for tenant '{tenant_id}'"),
                    error,
                )
            })?;

        row.map(action_from_row).transpose()
    }

    pub(super) async fn latest_status_impl(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Option<ActionStatusEntry>> {
        let row = sqlx::query_as::<_, StatusEntryRow>(
            r#"
            SELECT e.id, e.action_id, e.status, e.messages, e.occurred_at
            FROM action_status_entries e
            INNER JOIN actions a ON a.id = e.action_id
            WHERE a.tenant_id = $1 AND e.action_id = $2
            ORDER BY e.id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(action_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to load latest status of action '{action_id}'"),
                error,
            )
        })?;

        row.map(status_entry_from_row).transpose()
    }

    pub(super) async fn count_status_entries_impl(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM action_status_entries e
            INNER JOIN actions a ON a.id = e.action_id
            WHERE a.tenant_id = $1 AND e.action_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(action_id.value())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to count status entries of action '{action_id}'"),
                error,
            )
        })?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub(super) async fn list_status_entries_impl(
        &self,
        tenant_id: TenantId,
        action_id: ActionId,
    ) -> AppResult<Vec<ActionStatusEntry>> {
        let rows = sqlx::query_as::<_, StatusEntryRow>(
            r#"
            SELECT e.id, e.action_id, e.status, e.messages, e.occurred_at
            FROM action_status_entries e
            INNER JOIN actions a ON a.id = e.action_id
            WHERE a.tenant_id = $1 AND e.action_id = $2
            ORDER BY e.id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(action_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to list status entries of action '{action_id}'"),
                error,
            )
        })?;

        rows.into_iter().map(status_entry_from_row).collect()
    }

    pub(super) async fn list_active_actions_impl(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<Vec<Action>> {
        let sql = format!(
            "{ACTION_SELECT} WHERE tenant_id = $1 AND controller_id = $2 AND active ORDER BY id"
        );

        let rows = sqlx::query_as::<_, ActionRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(controller_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                map_database_error(
                    &format!("failed to list active actions of target '{controller_id}'"),
                    error,
                )
            })?;

        rows.into_iter().map(action_from_row).collect()
    }

    pub(super) async fn count_actions_for_target_impl(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
    ) -> AppResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM actions
            WHERE tenant_id = $1 AND controller_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(controller_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to count actions of target '{controller_id}'"),
                error,
            )
        })?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub(super) async fn has_action_for_distribution_set_impl(
        &self,
        tenant_id: TenantId,
        controller_id: &ControllerId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM actions
                WHERE tenant_id = $1 AND controller_id = $2 AND distribution_set_id = $3
            )
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(controller_id.as_str())
        .bind(distribution_set_id.value())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!(
                    "failed to check actions of target '{controller_id}' for distribution set '{distribution_set_id}'"
                ),
                error,
            )
        })
    }

    pub(super) async fn save_status_change_impl(
        &self,
        tenant_id: TenantId,
        change: ActionStatusChange,
    ) -> AppResult<Action> {
        let mut transaction = self.begin().await?;

        let action_id = change.action.id();
        let saved = update_action_in(&mut transaction, tenant_id, change.action).await?;
        if let Some(update) = &change.entry {
            insert_status_entry(&mut transaction, action_id, update).await?;
        }
        if let Some(target) = change.target {
            targets::update_target_in(&mut transaction, tenant_id, target).await?;
        }

        commit(transaction).await?;
        Ok(saved)
    }

    pub(super) async fn save_assignments_impl(
        &self,
        tenant_id: TenantId,
        writes: Vec<AssignmentWrite>,
    ) -> AppResult<Vec<Action>> {
        let mut transaction = self.begin().await?;
        let mut created = Vec::new();

        for write in writes {
            targets::update_target_in(&mut transaction, tenant_id, write.target).await?;

            for (action, update) in write.superseded {
                let action_id = action.id();
                update_action_in(&mut transaction, tenant_id, action).await?;
                insert_status_entry(&mut transaction, action_id, &update).await?;
            }

            for new_action in write.new_actions {
                let action =
                    insert_action_in(&mut transaction, tenant_id, new_action, write.created_at)
                        .await?;
                insert_status_entry(
                    &mut transaction,
                    action.id(),
                    &ActionStatusUpdate::new(ActionStatus::Running, write.created_at),
                )
                .await?;
                created.push(action);
            }
        }

        commit(transaction).await?;
        Ok(created)
    }

    pub(super) async fn delete_inactive_actions_impl(
        &self,
        tenant_id: TenantId,
        statuses: &[ActionStatus],
        modified_before: DateTime<Utc>,
        limit: usize,
    ) -> AppResult<u64> {
        if statuses.is_empty() || limit == 0 {
            return Ok(0);
        }

        let statuses: Vec<String> = statuses
            .iter()
            .map(|status| status.as_str().to_owned())
            .collect();
        let result = sqlx::query(
            r#"
            DELETE FROM actions
            WHERE id IN (
                SELECT id
                FROM actions
                WHERE tenant_id = $1
                    AND NOT active
                    AND status = ANY($2)
                    AND last_modified_at < $3
                ORDER BY id
                LIMIT $4
            )
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(statuses)
        .bind(modified_before)
        .bind(limit_param(limit))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to delete expired actions for tenant '{tenant_id}'"),
                error,
            )
        })?;

        Ok(result.rows_affected())
    }
}

async fn insert_action_in(
    connection: &mut PgConnection,
    tenant_id: TenantId,
    new_action: NewAction,
    created_at: DateTime<Utc>,
) -> AppResult<Action> {
    let window = new_action.maintenance_window.as_ref();
    let action_id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO actions (
            tenant_id,
            controller_id,
            distribution_set_id,
            status,
            active,
            weight,
            action_type,
            force_at,
            maintenance_schedule,
            maintenance_duration,
            maintenance_timezone,
            external_ref,
            initiated_by,
            created_at,
            last_modified_at,
            version
        )
        VALUES ($1, $2, $3, $4, true, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13, 1)
        RETURNING id
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(new_action.controller_id.as_str())
    .bind(new_action.distribution_set_id.value())
    .bind(ActionStatus::Running.as_str())
    .bind(new_action.weight)
    .bind(new_action.action_type.as_str())
    .bind(new_action.action_type.force_at())
    .bind(window.map(MaintenanceWindow::schedule))
    .bind(window.map(MaintenanceWindow::duration))
    .bind(window.map(MaintenanceWindow::timezone))
    .bind(new_action.external_ref.as_deref())
    .bind(new_action.initiated_by.as_deref())
    .bind(created_at)
    .fetch_one(&mut *connection)
    .await
    .map_err(|error| {
        map_database_error(
            &format!(
                "failed to create action for target '{}' in tenant '{tenant_id}'",
                new_action.controller_id
            ),
            error,
        )
    })?;

    let mut action = Action::create(ActionId::new(action_id), new_action, created_at)?;
    action.set_version(1);
    Ok(action)
}

/// Writes an action guarded by its loaded version.
async fn update_action_in(
    connection: &mut PgConnection,
    tenant_id: TenantId,
    mut action: Action,
) -> AppResult<Action> {
    let window = action.maintenance_window();
    let version = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE actions
        SET
            status = $3,
            active = $4,
            weight = $5,
            action_type = $6,
            force_at = $7,
            maintenance_schedule = $8,
            maintenance_duration = $9,
            maintenance_timezone = $10,
            external_ref = $11,
            last_modified_at = $12,
            version = version + 1
        WHERE tenant_id = $1 AND id = $2 AND version = $13
        RETURNING version
        "#,
    )
    .bind(tenant_id.as_uuid())
    .bind(action.id().value())
    .bind(action.status().as_str())
    .bind(action.is_active())
    .bind(action.weight())
    .bind(action.action_type().as_str())
    .bind(action.action_type().force_at())
    .bind(window.map(MaintenanceWindow::schedule))
    .bind(window.map(MaintenanceWindow::duration))
    .bind(window.map(MaintenanceWindow::timezone))
    .bind(action.external_ref())
    .bind(action.last_modified_at())
    .bind(action.version())
    .fetch_optional(&mut *connection)
    .await
    .map_err(|error| {
        map_database_error(
            &format!(
                "failed to update action '{}' for tenant '{tenant_id}'",
                action.id()
            ),
            error,
        )
    })?;

    let Some(version) = version else {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM actions WHERE tenant_id = $1 AND id = $2)",
        )
        .bind(tenant_id.as_uuid())
        .bind(action.id().value())
        .fetch_one(&mut *connection)
        .await
        .map_err(|error| map_database_error("failed to check action existence", error))?;

        return Err(if exists {
            AppError::ConcurrencyConflict(format!(
                "action '{}' was modified concurrently",
                action.id()
            ))
        } else {
            AppError::NotFound(format!(
                "action '{}' does not exist for tenant '{tenant_id}'",
                action.id()
            ))
        });
    };

    action.set_version(version);
    Ok(action)
}

async fn insert_status_entry(
    connection: &mut PgConnection,
    action_id: ActionId,
    update: &ActionStatusUpdate,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO action_status_entries (action_id, status, messages, occurred_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(action_id.value())
    .bind(update.status.as_str())
    .bind(update.messages.clone())
    .bind(update.occurred_at)
    .execute(&mut *connection)
    .await
    .map_err(|error| {
        map_database_error(
            &format!("failed to append status entry to action '{action_id}'"),
            error,
        )
    })?;

    Ok(())
}

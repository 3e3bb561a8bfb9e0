use super::*;

impl PostgresDeploymentRepository {
    pub(super) async fn list_auto_assign_queries_impl(
        &self,
        tenant_id: TenantId,
    ) -> AppResult<Vec<TargetFilterQuery>> {
        let rows = sqlx::query_as::<_, FilterQueryRow>(
            r#"
            SELECT
                id,
                name,
                query,
                auto_assign_distribution_set_id,
                auto_assign_action_type,
                auto_assign_weight,
                auto_assign_initiated_by,
                created_at
            FROM target_filter_queries
            WHERE tenant_id = $1 AND auto_assign_distribution_set_id IS NOT NULL
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to list auto assign queries for tenant '{tenant_id}'"),
                error,
            )
        })?;

        rows.into_iter().map(filter_query_from_row).collect()
    }

    pub(super) async fn find_filter_query_impl(
        &self,
        tenant_id: TenantId,
        query_id: TargetFilterQueryId,
    ) -> AppResult<Option<TargetFilterQuery>> {
        let row = sqlx::query_as::<_, FilterQueryRow>(
            r#"
            SELECT
                id,
                name,
                query,
                auto_assign_distribution_set_id,
                auto_assign_action_type,
                auto_assign_weight,
                auto_assign_initiated_by,
                created_at
            FROM target_filter_queries
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(query_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to load filter query '{query_id}' for tenant '{tenant_id}'"),
                error,
            )
        })?;

        row.map(filter_query_from_row).transpose()
    }

    pub(super) async fn save_filter_query_impl(
        &self,
        tenant_id: TenantId,
        query: TargetFilterQuery,
    ) -> AppResult<()> {
        let auto_assignment = query.auto_assignment();

        sqlx::query(
            r#"
            INSERT INTO target_filter_queries (
                tenant_id,
                id,
                name,
                query,
                auto_assign_distribution_set_id,
                auto_assign_action_type,
                auto_assign_weight,
                auto_assign_initiated_by,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, id)
            DO UPDATE SET
                name = EXCLUDED.name,
                query = EXCLUDED.query,
                auto_assign_distribution_set_id = EXCLUDED.auto_assign_distribution_set_id,
                auto_assign_action_type = EXCLUDED.auto_assign_action_type,
                auto_assign_weight = EXCLUDED.auto_assign_weight,
                auto_assign_initiated_by = EXCLUDED.auto_assign_initiated_by
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(query.id().value())
        .bind(query.name())
        .bind(query.query())
        .bind(auto_assignment.map(|assignment| assignment.distribution_set_id().value()))
        .bind(auto_assignment.map(|assignment| assignment.action_type().as_str()))
        .bind(auto_assignment.and_then(AutoAssignment::weight))
        .bind(auto_assignment.and_then(AutoAssignment::initiated_by))
        .bind(query.created_at())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!(
                    "failed to save filter query '{}' for tenant '{tenant_id}'",
                    query.id()
                ),
                error,
            )
        })?;

        Ok(())
    }

    pub(super) async fn find_distribution_set_impl(
        &self,
        tenant_id: TenantId,
        distribution_set_id: DistributionSetId,
    ) -> AppResult<Option<DistributionSet>> {
        let row = sqlx::query_as::<_, DistributionSetRow>(
            r#"
            SELECT id, name, version, type_key, complete, deleted
            FROM distribution_sets
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(distribution_set_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!(
                    "failed to load distribution set '{distribution_set_id}' for tenant '{tenant_id}'"
                ),
                error,
            )
        })?;

        row.map(distribution_set_from_row).transpose()
    }

    pub(super) async fn save_distribution_set_impl(
        &self,
        tenant_id: TenantId,
        distribution_set: DistributionSet,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO distribution_sets (tenant_id, id, name, version, type_key, complete, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, id)
            DO UPDATE SET
                name = EXCLUDED.name,
                version = EXCLUDED.version,
                type_key = EXCLUDED.type_key,
                complete = EXCLUDED.complete,
                deleted = EXCLUDED.deleted
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(distribution_set.id().value())
        .bind(distribution_set.name())
        .bind(distribution_set.version())
        .bind(distribution_set.type_key())
        .bind(distribution_set.is_complete())
        .bind(distribution_set.is_deleted())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!(
                    "failed to save distribution set '{}' for tenant '{tenant_id}'",
                    distribution_set.id()
                ),
                error,
            )
        })?;

        Ok(())
    }

    /// Purges soft-deleted rollouts once no action references them.
    pub(super) async fn delete_soft_deleted_rollouts_impl(
        &self,
        tenant_id: TenantId,
        limit: usize,
    ) -> AppResult<u64> {
        if limit == 0 {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM rollouts
            WHERE tenant_id = $1 AND id IN (
                SELECT r.id
                FROM rollouts r
                WHERE r.tenant_id = $1
                    AND r.deleted
                    AND NOT EXISTS (
                        SELECT 1
                        FROM actions a
                        WHERE a.tenant_id = r.tenant_id AND a.rollout_id = r.id
                    )
                ORDER BY r.id
                LIMIT $2
            )
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(limit_param(limit))
        .execute(&self.pool)
        .await
        .map_err(|error| {
            map_database_error(
                &format!("failed to purge deleted rollouts for tenant '{tenant_id}'"),
                error,
            )
        })?;

        Ok(result.rows_affected())
    }
}

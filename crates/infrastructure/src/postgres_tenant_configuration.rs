use async_trait::async_trait;
use fleetgate_application::{ConfigValue, TenantConfiguration, TenantDirectory};
use fleetgate_core::{AppError, AppResult, TenantId};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// PostgreSQL-backed tenant configuration and tenant directory.
#[derive(Clone)]
pub struct PostgresTenantConfiguration {
    pool: PgPool,
}

impl PostgresTenantConfiguration {
    /// Creates a configuration store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates or replaces one configuration value.
    pub async fn set_value(
        &self,
        tenant_id: TenantId,
        key: &str,
        value: &ConfigValue,
    ) -> AppResult<()> {
        let (value_type, value) = match value {
            ConfigValue::Bool(flag) => ("bool", flag.to_string()),
            ConfigValue::Integer(number) => ("integer", number.to_string()),
            ConfigValue::Text(text) => ("text", text.clone()),
        };

        sqlx::query(
            r#"
            INSERT INTO tenant_configurations (tenant_id, key, value_type, value, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (tenant_id, key)
            DO UPDATE SET
                value_type = EXCLUDED.value_type,
                value = EXCLUDED.value,
                updated_at = now()
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .bind(value_type)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to save configuration '{key}' for tenant '{tenant_id}': {error}"
            ))
        })?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ConfigurationRow {
    value_type: String,
    value: String,
}

fn config_value_from_row(key: &str, row: ConfigurationRow) -> AppResult<ConfigValue> {
    match row.value_type.as_str() {
        "bool" => row.value.parse::<bool>().map(ConfigValue::Bool).map_err(|error| {
            AppError::Validation(format!("configuration '{key}' is not a boolean: {error}"))
        }),
        "integer" => row.value.parse::<i64>().map(ConfigValue::Integer).map_err(|error| {
            AppError::Validation(format!("configuration '{key}' is not an integer: {error}"))
        }),
        "text" => Ok(ConfigValue::Text(row.value)),
        other => Err(AppError::Internal(format!(
            "configuration '{key}' has unknown value type '{other}'"
        ))),
    }
}

#[async_trait]
impl TenantConfiguration for PostgresTenantConfiguration {
    async fn get_value(&self, tenant_id: TenantId, key: &str) -> AppResult<Option<ConfigValue>> {
        let row = sqlx::query_as::<_, ConfigurationRow>(
            r#"
            SELECT value_type, value
            FROM tenant_configurations
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to load configuration '{key}' for tenant '{tenant_id}': {error}"
            ))
        })?;

        row.map(|row| config_value_from_row(key, row)).transpose()
    }
}

#[async_trait]
impl TenantDirectory for PostgresTenantConfiguration {
    async fn list_tenants(&self) -> AppResult<Vec<TenantId>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| AppError::Internal(format!("failed to list tenants: {error}")))?;

        Ok(ids.into_iter().map(TenantId::from_uuid).collect())
    }
}

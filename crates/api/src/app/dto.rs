//! Path parsing and response bodies.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use fulfillsync_core::{EntityType, LocalId};
use fulfillsync_infra::jobs::JobId;

use super::errors::json_error;

/// `/sync/:entity/:id` path segments.
#[derive(Debug, Deserialize)]
pub struct EntityPath {
    pub entity: String,
    pub id: String,
}

impl EntityPath {
    pub fn parse(&self) -> Result<(EntityType, LocalId), axum::response::Response> {
        let entity_type = self.entity.parse::<EntityType>().map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "invalid_entity",
                "entity must be one of: order, product",
            )
        })?;
        let id = self.id.parse::<LocalId>().map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "invalid_id",
                format!("invalid {entity_type} id: {}", self.id),
            )
        })?;
        Ok((entity_type, id))
    }
}

#[derive(Debug, Serialize)]
pub struct SyncQueuedResponse {
    pub job_id: JobId,
    pub entity_type: EntityType,
    pub entity_id: LocalId,
}

#[derive(Debug, Serialize)]
pub struct WebhookAcceptedResponse {
    pub success: bool,
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub fn limit_or(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(entity: &str, id: &str) -> EntityPath {
        EntityPath {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    #[test]
    fn entity_paths_parse() {
        let (entity_type, id) = path("order", "42").parse().unwrap();
        assert_eq!(entity_type, EntityType::Order);
        assert_eq!(id, LocalId::new(42));

        assert_eq!(
            path("invoice", "42").parse().unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            path("product", "abc").parse().unwrap_err().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(LimitQuery { limit: None }.limit_or(50, 500), 50);
        assert_eq!(LimitQuery { limit: Some(0) }.limit_or(50, 500), 1);
        assert_eq!(LimitQuery { limit: Some(9_999) }.limit_or(50, 500), 500);
    }
}

//! Built-in services every hub answers.

use crate::directory::{Directory, WeakDirectory};
use crate::handler::{HandlerId, HandlerResult, MessageHandler};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use urnet_types::BusResult;

/// Echoes the call payload back.
pub const REFLECT: &str = "NET:SRV_REFLECT";

/// Lists every name serviceable at the answering directory.
pub const SERVICE_LIST: &str = "NET:SRV_SERVICE_LIST";

struct Reflect;

#[async_trait]
impl MessageHandler for Reflect {
    async fn handle(&self, payload: Value) -> HandlerResult {
        Ok(payload)
    }
}

struct ServiceList {
    directory: WeakDirectory,
}

#[async_trait]
impl MessageHandler for ServiceList {
    async fn handle(&self, _payload: Value) -> HandlerResult {
        let dir = self
            .directory
            .upgrade()
            .ok_or_else(|| "directory is gone".to_string())?;
        Ok(json!({
            "address": dir.address(),
            "services": dir.services(),
        }))
    }
}

/// Register the built-in services on `dir`.
pub fn register_builtins(dir: &Directory) -> BusResult<Vec<HandlerId>> {
    let reflect = dir.register_handler(REFLECT, Arc::new(Reflect))?;
    let list = dir.register_handler(
        SERVICE_LIST,
        Arc::new(ServiceList {
            directory: dir.downgrade(),
        }),
    )?;
    Ok(vec![reflect, list])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_service_list_reports_local_names() {
        let dir = Directory::new(Default::default()).unwrap();
        register_builtins(&dir).unwrap();
        let list = ServiceList {
            directory: dir.downgrade(),
        };
        let reply = list.handle(json!({})).await.unwrap();
        assert_eq!(reply["address"], json!("SVR_01"));
        assert_eq!(reply["services"][REFLECT], json!(["SVR_01"]));
        assert!(reply["services"].get(SERVICE_LIST).is_some());
    }

    #[tokio::test]
    async fn test_service_list_outliving_directory() {
        let dir = Directory::new(Default::default()).unwrap();
        let list = ServiceList {
            directory: dir.downgrade(),
        };
        drop(dir);
        assert!(list.handle(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_reflect_returns_payload() {
        assert_eq!(
            Reflect.handle(json!({"a": [1, 2]})).await.unwrap(),
            json!({"a": [1, 2]})
        );
    }
}

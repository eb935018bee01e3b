use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use menuplan_core::error::StoreError;
use menuplan_core::models::{StoredWeekMenu, WeekMenuRecord};
use menuplan_core::store::WeekMenuStore;

/// HTTP client for the `weekmenus` resource served by `menuplan serve`.
pub struct RemoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "menuplan-cli/{} (week menu planner)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Cheap reachability probe used for connectivity detection.
    pub async fn health(&self) -> Result<()> {
        let resp = self
            .request(Method::GET, "/api/health")
            .send()
            .await
            .context("Failed to reach menuplan server")?;
        if !resp.status().is_success() {
            bail!("menuplan server unhealthy ({})", resp.status());
        }
        Ok(())
    }

    async fn send(builder: RequestBuilder) -> Result<Response, StoreError> {
        builder
            .send()
            .await
            .map_err(|e| StoreError::unreachable(e.to_string()))
    }

    async fn rejected(resp: Response) -> StoreError {
        let status = resp.status();
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        };
        StoreError::rejected(status.as_u16(), message)
    }

    async fn read_row(resp: Response) -> Result<StoredWeekMenu, StoreError> {
        let row = resp
            .json()
            .await
            .context("Failed to parse week menu response")?;
        Ok(row)
    }
}

#[async_trait]
impl WeekMenuStore for RemoteClient {
    async fn find_latest_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StoredWeekMenu>, StoreError> {
        let resp = Self::send(
            self.request(Method::GET, "/api/weekmenus/latest")
                .query(&[("subscription_id", subscription_id)]),
        )
        .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Self::read_row(resp).await.map(Some),
            _ => Err(Self::rejected(resp).await),
        }
    }

    async fn insert(&self, record: &WeekMenuRecord) -> Result<i64, StoreError> {
        let resp = Self::send(self.request(Method::POST, "/api/weekmenus").json(record)).await?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await);
        }
        Ok(Self::read_row(resp).await?.id)
    }

    async fn update(&self, id: i64, record: &WeekMenuRecord) -> Result<(), StoreError> {
        let resp = Self::send(
            self.request(Method::PUT, &format!("/api/weekmenus/{id}"))
                .json(record),
        )
        .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(id)),
            s if s.is_success() => Ok(()),
            _ => Err(Self::rejected(resp).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{AppState, build_router};
    use menuplan_core::cache::{MemoryCache, load_menu};
    use menuplan_core::db::Database;
    use menuplan_core::engine::WeekMenuEngine;
    use menuplan_core::models::RecipeSelection;
    use menuplan_core::session::{Session, SessionHandle, Subscription};
    use std::sync::{Arc, Mutex};

    async fn serve(api_key: Option<&str>) -> (String, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let app = build_router(AppState {
            db: db.clone(),
            api_key: api_key.map(str::to_string),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), db)
    }

    fn record(version: u64) -> WeekMenuRecord {
        WeekMenuRecord {
            subscription_id: "sub-1".to_string(),
            seed: 321,
            version,
            recipes: vec![RecipeSelection {
                recipe_id: "risotto".to_string(),
                servings: 2,
            }],
        }
    }

    #[tokio::test]
    async fn client_round_trips_against_server() {
        let (url, _db) = serve(Some("secret")).await;
        let client = RemoteClient::new(&url, Some("secret".to_string()));

        client.health().await.unwrap();
        assert!(
            client
                .find_latest_for_subscription("sub-1")
                .await
                .unwrap()
                .is_none()
        );

        let id = client.insert(&record(1)).await.unwrap();
        client.update(id, &record(2)).await.unwrap();
        let latest = client
            .find_latest_for_subscription("sub-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.version, 2);

        let err = client.update(id + 100, &record(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn client_maps_rejections() {
        let (url, _db) = serve(Some("secret")).await;

        let anonymous = RemoteClient::new(&url, None);
        // Health stays open for connectivity probes
        anonymous.health().await.unwrap();
        let err = anonymous.insert(&record(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 401, .. }));

        let client = RemoteClient::new(&url, Some("secret".to_string()));
        let mut bad = record(1);
        bad.seed = 0;
        let err = client.insert(&bad).await.unwrap_err();
        let StoreError::Rejected { status, message } = err else {
            panic!("expected a rejection");
        };
        assert_eq!(status, 400);
        assert!(message.contains("seed"));
    }

    #[tokio::test]
    async fn unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RemoteClient::new(&format!("http://{addr}"), None);
        assert!(client.health().await.is_err());
        let err = client.insert(&record(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
    }

    #[tokio::test]
    async fn engine_syncs_through_server() {
        let (url, db) = serve(None).await;
        let client: Arc<RemoteClient> = Arc::new(RemoteClient::new(&url, None));
        let session = Session::signed_in(
            "user-1",
            Some(Subscription {
                id: "sub-1".to_string(),
                default_servings: 2,
            }),
        );

        let cache = Arc::new(MemoryCache::new());
        let engine = WeekMenuEngine::builder(cache.clone(), client.clone())
            .session(SessionHandle::new(session.clone()))
            .build();
        engine.initialize().await;
        engine.add_recipe("enchiladas", Some(4));
        engine.add_recipe("gumbo", None);
        engine.flush().await;

        let menu = engine.weekmenu().unwrap();
        let id = menu.id.unwrap();
        assert_eq!(load_menu(cache.as_ref()).unwrap().id, Some(id));
        let stored = db.lock().unwrap().get_weekmenu(id).unwrap().unwrap();
        assert_eq!(stored.recipes, menu.recipes);
        assert_eq!(stored.version, menu.version);

        // A second device starting from scratch picks up the same menu
        let other = WeekMenuEngine::builder(Arc::new(MemoryCache::new()), client)
            .session(SessionHandle::new(session))
            .build();
        other.initialize().await;
        let adopted = other.weekmenu().unwrap();
        assert_eq!(adopted.id, Some(id));
        assert_eq!(adopted.seed, menu.seed);
        assert_eq!(adopted.recipes, menu.recipes);
    }
}

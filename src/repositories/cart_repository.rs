use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::Cart;

/// Durable per-user cart cache. The only source of truth while the remote
/// cart service is unreachable.
#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<Cart>, ServiceError>;
    async fn put(&self, cart: &Cart) -> Result<(), ServiceError>;
    async fn delete(&self, user_id: Uuid) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCartRepository {
    carts: DashMap<Uuid, Cart>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }
}

#[async_trait]
impl CartRepository for InMemoryCartRepository {
    async fn get(&self, user_id: Uuid) -> Result<Option<Cart>, ServiceError> {
        Ok(self.carts.get(&user_id).map(|c| c.value().clone()))
    }

    async fn put(&self, cart: &Cart) -> Result<(), ServiceError> {
        self.carts.insert(cart.user_id, cart.clone());
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.carts.remove(&user_id);
        Ok(())
    }
}

/// Redis-backed cart cache. Carts are stored as JSON under `{namespace}:{user_id}`.
#[derive(Clone)]
pub struct RedisCartRepository {
    client: redis::Client,
    namespace: String,
}

impl RedisCartRepository {
    pub fn new(redis_url: &str, namespace: impl Into<String>) -> Result<Self, ServiceError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    fn key(&self, user_id: Uuid) -> String {
        format!("{}:{}", self.namespace, user_id)
    }
}

#[async_trait]
impl CartRepository for RedisCartRepository {
    #[instrument(skip(self))]
    async fn get(&self, user_id: Uuid) -> Result<Option<Cart>, ServiceError> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(user_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, cart), fields(user_id = %cart.user_id))]
    async fn put(&self, cart: &Cart) -> Result<(), ServiceError> {
        let json = serde_json::to_string(cart)?;
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("SET")
            .arg(self.key(cart.user_id))
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(entries = cart.entries.len(), "cart cached");
        Ok(())
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("DEL")
            .arg(self.key(user_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

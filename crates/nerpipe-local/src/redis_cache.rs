use nerpipe_core::{Cache, Error, GetPipeline, Lookup, LookupHandle, Result, SetPipeline};
use redis::aio::MultiplexedConnection;

/// String key/value store backend: `GET`/`SET` batched in one redis pipeline per `exec`.
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Cache(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        tracing::info!(url, "connected to redis");
        Ok(Self { conn })
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Cache for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn new_get_pipeline(&self, capacity: usize) -> Box<dyn GetPipeline> {
        Box::new(RedisGetPipeline {
            conn: self.conn.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    fn new_set_pipeline(&self, capacity: usize) -> Box<dyn SetPipeline> {
        Box::new(RedisSetPipeline {
            conn: self.conn.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    async fn ready(&self) -> bool {
        let mut conn = self.conn.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "redis ping failed");
                false
            }
        }
    }
}

struct RedisGetPipeline {
    conn: MultiplexedConnection,
    queue: Vec<(LookupHandle, String)>,
}

#[async_trait::async_trait]
impl GetPipeline for RedisGetPipeline {
    fn get(&mut self, handle: LookupHandle, key: String) {
        self.queue.push((handle, key));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<Vec<(LookupHandle, Option<Lookup>)>> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for (_, key) in &queue {
            pipe.get(key);
        }
        let values: Vec<Option<Vec<u8>>> = pipe
            .query_async(&mut self.conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        if values.len() != queue.len() {
            return Err(Error::Cache(format!(
                "redis pipeline returned {} replies for {} commands",
                values.len(),
                queue.len()
            )));
        }
        queue
            .into_iter()
            .zip(values)
            .map(|((handle, _), value)| {
                let lookup = value.map(|v| Lookup::from_slice(&v)).transpose()?;
                Ok((handle, lookup))
            })
            .collect()
    }
}

struct RedisSetPipeline {
    conn: MultiplexedConnection,
    queue: Vec<(String, Vec<u8>)>,
}

#[async_trait::async_trait]
impl SetPipeline for RedisSetPipeline {
    fn set(&mut self, key: String, value: Vec<u8>) {
        self.queue.push((key, value));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in &queue {
            pipe.set(key, value.as_slice()).ignore();
        }
        pipe.query_async::<()>(&mut self.conn)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }
}

// src/core/store/resp_client.rs

//! A `KvStore` backed by any Redis-compatible server (Redis, SpinelDB, ...),
//! reached over a small pool of RESP connections.

use super::resp::{RespFrame, RespFrameCodec, RespValue};
use super::{KvStore, Script};
use crate::config::StoreConfig;
use crate::core::BrokerError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// One lazily established connection to the store.
#[derive(Debug)]
struct RespConnection {
    stream: TcpStream,
    codec: RespFrameCodec,
    read_buf: BytesMut,
}

impl RespConnection {
    async fn connect(config: &StoreConfig) -> Result<Self, BrokerError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.addr))
            .await
            .map_err(|_| {
                BrokerError::Store(format!("timed out connecting to {}", config.addr))
            })??;
        stream.set_nodelay(true)?;
        let mut conn = Self {
            stream,
            codec: RespFrameCodec,
            read_buf: BytesMut::with_capacity(4096),
        };
        if let Some(password) = &config.password {
            let reply = conn
                .send_and_receive(RespFrame::command([
                    Bytes::from_static(b"AUTH"),
                    Bytes::from(password.clone()),
                ]))
                .await?;
            RespValue::from(reply).into_result()?;
        }
        debug!("Connected to store at {}", config.addr);
        Ok(conn)
    }

    /// Sends one frame and waits for exactly one reply frame.
    async fn send_and_receive(&mut self, frame: RespFrame) -> Result<RespFrame, BrokerError> {
        let mut write_buf = BytesMut::new();
        self.codec.encode(frame, &mut write_buf)?;
        self.stream.write_all(&write_buf).await?;

        loop {
            if let Some(reply) = self.codec.decode(&mut self.read_buf)? {
                return Ok(reply);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(BrokerError::Store("connection closed by store".into()));
            }
        }
    }
}

/// A pooled RESP client. Each call borrows one connection, chosen round-robin,
/// for a single request/reply exchange bounded by the operation timeout. A
/// connection that fails or times out is dropped and re-established on next
/// use.
#[derive(Debug)]
pub struct RespStore {
    config: StoreConfig,
    pool: Vec<Mutex<Option<RespConnection>>>,
    next: AtomicUsize,
}

impl RespStore {
    pub fn new(config: StoreConfig) -> Self {
        let pool = (0..config.pool_size.max(1))
            .map(|_| Mutex::new(None))
            .collect();
        Self {
            config,
            pool,
            next: AtomicUsize::new(0),
        }
    }

    /// Runs one command and returns its reply, with error replies converted
    /// into `BrokerError::Store`.
    pub async fn command<I, A>(&self, args: I) -> Result<RespValue, BrokerError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.raw_command(RespFrame::command(args))
            .await?
            .into_result()
    }

    async fn raw_command(&self, frame: RespFrame) -> Result<RespValue, BrokerError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let mut guard = self.pool[slot].lock().await;

        let exchange = async {
            if guard.is_none() {
                *guard = Some(RespConnection::connect(&self.config).await?);
            }
            match guard.as_mut() {
                Some(conn) => conn.send_and_receive(frame).await,
                None => Err(BrokerError::Internal("store connection missing".into())),
            }
        };

        let outcome = tokio::time::timeout(self.config.op_timeout, exchange).await;
        match outcome {
            Ok(Ok(reply)) => Ok(RespValue::from(reply)),
            Ok(Err(e)) => {
                warn!("Store connection {slot} failed: {e}");
                *guard = None;
                Err(e)
            }
            Err(_) => {
                // The reply may still arrive later; the connection can no
                // longer be trusted to be in sync.
                *guard = None;
                Err(BrokerError::Store(format!(
                    "store operation timed out after {:?}",
                    self.config.op_timeout
                )))
            }
        }
    }
}

fn millis(d: Duration) -> Bytes {
    Bytes::from(d.as_millis().max(1).to_string())
}

fn expect_integer(reply: RespValue) -> Result<i64, BrokerError> {
    reply
        .as_integer()
        .ok_or_else(|| BrokerError::Store(format!("expected integer reply, got {reply:?}")))
}

fn bulk_strings(reply: RespValue) -> Result<Vec<Bytes>, BrokerError> {
    match reply {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| {
                item.into_bytes()
                    .ok_or_else(|| BrokerError::Store("expected bulk string element".into()))
            })
            .collect(),
        RespValue::Null => Ok(Vec::new()),
        other => Err(BrokerError::Store(format!("expected array reply, got {other:?}"))),
    }
}

#[async_trait]
impl KvStore for RespStore {
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let mut args = vec![Bytes::from_static(b"SET"), Bytes::from(key.to_owned()), value];
        if let Some(ttl) = ttl {
            args.push(Bytes::from_static(b"PX"));
            args.push(millis(ttl));
        }
        self.command(args).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool, BrokerError> {
        let reply = self
            .command([
                Bytes::from_static(b"SET"),
                Bytes::from(key.to_owned()),
                value,
                Bytes::from_static(b"PX"),
                millis(ttl),
                Bytes::from_static(b"NX"),
            ])
            .await?;
        Ok(!matches!(reply, RespValue::Null))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BrokerError> {
        let reply = self.command(["GET", key].map(str::to_owned)).await?;
        Ok(reply.into_bytes())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let reply = self
            .command([
                Bytes::from_static(b"PEXPIRE"),
                Bytes::from(key.to_owned()),
                millis(ttl),
            ])
            .await?;
        Ok(expect_integer(reply)? == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
        let ms = expect_integer(self.command(["PTTL", key].map(str::to_owned)).await?)?;
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let reply = self.command(["DEL", key].map(str::to_owned)).await?;
        Ok(expect_integer(reply)? > 0)
    }

    async fn eval_atomic(
        &self,
        script: &Script,
        keys: &[String],
        args: &[Bytes],
    ) -> Result<RespValue, BrokerError> {
        let tail = || {
            let mut tail = Vec::with_capacity(1 + keys.len() + args.len());
            tail.push(Bytes::from(keys.len().to_string()));
            tail.extend(keys.iter().map(|k| Bytes::from(k.clone())));
            tail.extend(args.iter().cloned());
            tail
        };

        let mut evalsha = vec![
            Bytes::from_static(b"EVALSHA"),
            Bytes::from(script.sha1().to_owned()),
        ];
        evalsha.extend(tail());
        match self.raw_command(RespFrame::command(evalsha)).await? {
            RespValue::Error(e) if e.starts_with("NOSCRIPT") => {
                debug!("Script {} not cached by store, sending source", script.sha1());
                let mut eval = vec![
                    Bytes::from_static(b"EVAL"),
                    Bytes::from(script.source().to_owned()),
                ];
                eval.extend(tail());
                self.command(eval).await
            }
            other => other.into_result(),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, BrokerError> {
        expect_integer(self.command(["INCR", key].map(str::to_owned)).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<bool, BrokerError> {
        let reply = self
            .command([
                Bytes::from_static(b"HSET"),
                Bytes::from(key.to_owned()),
                Bytes::from(field.to_owned()),
                value,
            ])
            .await?;
        Ok(expect_integer(reply)? == 1)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Bytes)>, BrokerError> {
        let flat = bulk_strings(self.command(["HGETALL", key].map(str::to_owned)).await?)?;
        if flat.len() % 2 != 0 {
            return Err(BrokerError::Store("odd number of elements in HGETALL reply".into()));
        }
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((String::from_utf8(field.to_vec())?, value));
        }
        Ok(pairs)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, BrokerError> {
        let reply = self.command(["HDEL", key, field].map(str::to_owned)).await?;
        Ok(expect_integer(reply)? > 0)
    }

    async fn sorted_set_add(
        &self,
        key: &str,
        members: &[(f64, String)],
    ) -> Result<usize, BrokerError> {
        let mut args = vec![Bytes::from_static(b"ZADD"), Bytes::from(key.to_owned())];
        for (score, member) in members {
            args.push(Bytes::from(score.to_string()));
            args.push(Bytes::from(member.clone()));
        }
        Ok(expect_integer(self.command(args).await?)?.max(0) as usize)
    }

    async fn sorted_set_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, BrokerError> {
        let reply = self
            .command([
                "ZRANGE".to_owned(),
                key.to_owned(),
                start.to_string(),
                stop.to_string(),
            ])
            .await?;
        bulk_strings(reply)?
            .into_iter()
            .map(|m| String::from_utf8(m.to_vec()).map_err(BrokerError::from))
            .collect()
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        match self.command(["PING"].map(str::to_owned)).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(BrokerError::Store(format!("unexpected PING reply: {other:?}"))),
        }
    }
}

//! Redis-backed liveness index operations.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::{devices_key, plan_transitions, status_key, LivenessError, OfflineTransition};

/// Handle to the liveness sorted sets and status memos.
#[derive(Clone)]
pub struct LivenessIndex {
    conn: ConnectionManager,
    track_secs: i64,
}

impl LivenessIndex {
    pub async fn connect(url: &str, track_secs: i64) -> Result<Self, LivenessError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, track_secs })
    }

    /// Check index connectivity.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    /// Record an ingest for `(topic, device_id)` at `now` epoch seconds.
    ///
    /// The sorted-set score only moves forward in practice because `now` is
    /// taken at ingest time; the memo flips back to `online` so the next
    /// scan sees the transition edge again.
    pub async fn touch(
        &self,
        topic: &str,
        device_id: &str,
        now_epoch_s: i64,
    ) -> Result<(), LivenessError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(devices_key(topic), device_id, now_epoch_s).await?;
        if self.track_secs > 0 {
            let _: () = conn
                .set_ex(status_key(topic, device_id), "online", self.track_secs as u64)
                .await?;
        } else {
            let _: () = conn.set(status_key(topic, device_id), "online").await?;
        }
        debug!(topic = %topic, device_id = %device_id, "liveness touched");
        Ok(())
    }

    /// Scan one topic for devices whose last-seen is at or past the
    /// staleness threshold; memoise and return the fresh transitions.
    pub async fn scan_topic(
        &self,
        topic: &str,
        stale_secs: i64,
        now_epoch_s: i64,
    ) -> Result<Vec<OfflineTransition>, LivenessError> {
        let mut conn = self.conn.clone();
        let zset_key = devices_key(topic);

        if self.track_secs > 0 {
            let _: () = conn
                .zrembyscore(&zset_key, 0, now_epoch_s - self.track_secs)
                .await?;
        }

        let cutoff = now_epoch_s - stale_secs;
        let stale: Vec<(String, f64)> = conn.zrangebyscore_withscores(&zset_key, 0, cutoff).await?;
        let stale: Vec<(String, i64)> = stale
            .into_iter()
            .map(|(device_id, score)| (device_id, score as i64))
            .collect();

        let mut memos = Vec::with_capacity(stale.len());
        for (device_id, _) in &stale {
            let memo: Option<String> = conn.get(status_key(topic, device_id)).await?;
            memos.push(memo);
        }

        let transitions = plan_transitions(topic, &stale, &memos);
        for transition in &transitions {
            let key = status_key(topic, &transition.device_id);
            if self.track_secs > 0 {
                let _: () = conn.set_ex(key, "offline", self.track_secs as u64).await?;
            } else {
                let _: () = conn.set(key, "offline").await?;
            }
        }
        Ok(transitions)
    }
}

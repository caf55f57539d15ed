use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, TrackErrorKind};
use crate::protocol::TrackInfo;

/// Correlates local publish requests with server acknowledgments by the
/// client-assigned id. Each cid holds at most one resolver, completed exactly
/// once by the matching response or cancelled when the registry is cleared.
#[derive(Debug, Default)]
pub struct PendingTrackRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<TrackInfo>>>,
}

impl PendingTrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn register(&self, cid: &str) -> Result<oneshot::Receiver<TrackInfo>, Error> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(cid) {
            return Err(Error::new_track(
                format!("a publication for {} is already pending", cid),
                TrackErrorKind::DuplicatePublication,
            ));
        }
        let (sender, receiver) = oneshot::channel();
        pending.insert(cid.to_owned(), sender);
        Ok(receiver)
    }

    /// Completes the resolver for `cid`, returning false when nothing was
    /// pending under that id.
    pub(crate) async fn resolve(&self, cid: &str, info: TrackInfo) -> bool {
        let sender = self.pending.lock().await.remove(cid);
        match sender {
            Some(sender) => sender.send(info).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn remove(&self, cid: &str) {
        self.pending.lock().await.remove(cid);
    }

    /// Drops every outstanding resolver; their waiters observe cancellation.
    pub(crate) async fn clear(&self) {
        self.pending.lock().await.clear();
    }

    pub(crate) async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

use std::ops::Deref;

use tokio::select;
use tokio_util::sync::{CancellationToken, DropGuard};


/// A cancellation token that fires as soon as any of its parents fires. Dropping it cancels the
///  joined token (never the parents), which also ends the tasks watching the parents.
pub struct JoinedCancellation {
    token: CancellationToken,
    _guard: DropGuard,
}

impl Deref for JoinedCancellation {
    type Target = CancellationToken;

    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

/// Must be called from within a tokio runtime if there is more than one parent.
pub fn join_cancellation(parents: &[&CancellationToken]) -> JoinedCancellation {
    let token = match parents.first() {
        Some(first) => first.child_token(),
        None => CancellationToken::new(),
    };

    for &parent in parents.iter().skip(1) {
        if parent.is_cancelled() {
            token.cancel();
            break;
        }

        let parent = parent.clone();
        let joined = token.clone();
        tokio::spawn(async move {
            select! {
                _ = parent.cancelled() => joined.cancel(),
                _ = joined.cancelled() => {}
            }
        });
    }

    JoinedCancellation {
        _guard: token.clone().drop_guard(),
        token,
    }
}

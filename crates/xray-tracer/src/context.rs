// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The segment a task is currently working under.

use std::future::Future;

use crate::segment::Segment;

tokio::task_local! {
    static CURRENT_SEGMENT: Segment;
}

/// Runs `fut` with `segment` as its current segment.
pub async fn scope<F: Future>(segment: Segment, fut: F) -> F::Output {
    CURRENT_SEGMENT.scope(segment, fut).await
}

/// The segment set by the innermost enclosing [`scope`], if any.
#[must_use]
pub fn current_segment() -> Option<Segment> {
    CURRENT_SEGMENT.try_with(Segment::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::recorder::Recorder;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_scopes_nest() {
        let (recorder, _rx) = Recorder::detached(Config::default());
        let outer = recorder.begin_segment("outer", CancellationToken::new());
        let inner = recorder.begin_segment("inner", CancellationToken::new());

        assert!(current_segment().is_none());
        scope(outer.clone(), async {
            assert_eq!(current_segment().map(|s| s.id().to_string()).as_deref(), Some(outer.id()));
            scope(inner.clone(), async {
                assert_eq!(
                    current_segment().map(|s| s.id().to_string()).as_deref(),
                    Some(inner.id())
                );
            })
            .await;
            assert_eq!(current_segment().map(|s| s.id().to_string()).as_deref(), Some(outer.id()));
        })
        .await;
        assert!(current_segment().is_none());
    }
}

use bibedit_core::{EditRequest, RecId, RequestEnvelope, Response, TransactionId};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// The editing endpoint. Implementations send one JSON request and return the
/// decoded reply.
pub trait Transport {
    fn send(&mut self, request: &RequestEnvelope) -> Result<Response, TransportError>;
}

#[derive(Debug, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    Sent(Response),
    /// The bulk request was lost. Its requests are not retried.
    Failed(TransportError),
}

/// Record updates waiting to be sent as one bulk request.
#[derive(Debug)]
pub struct RequestQueue {
    pending: Vec<RequestEnvelope>,
    dirty: bool,
    last_completed_ms: u64,
    auto_flush_interval_ms: u64,
}

impl RequestQueue {
    pub fn new(auto_flush_interval_ms: u64) -> Self {
        Self {
            pending: Vec::new(),
            dirty: false,
            last_completed_ms: 0,
            auto_flush_interval_ms,
        }
    }

    /// Stores a copy of the request.
    pub fn enqueue(&mut self, request: &RequestEnvelope) {
        debug!(id = %request.id, kind = request.request.request_type(), "queued");
        self.pending.push(request.clone());
        self.dirty = true;
    }

    pub fn pending(&self) -> &[RequestEnvelope] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Unsent changes exist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_completed_ms(&self) -> u64 {
        self.last_completed_ms
    }

    /// Due only with pending requests and strictly more than the interval
    /// since the last flush completed.
    pub fn should_auto_flush(&self, now_ms: u64) -> bool {
        !self.pending.is_empty()
            && now_ms.saturating_sub(self.last_completed_ms) > self.auto_flush_interval_ms
    }

    /// Drop everything pending without sending it.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.dirty = false;
    }

    /// Send all pending requests, in order, as one `applyBulkUpdates`.
    ///
    /// Success or failure, the pending list is emptied and the completion
    /// time recorded.
    pub fn flush<T: Transport>(
        &mut self,
        transport: &mut T,
        rec_id: Option<RecId>,
        id: TransactionId,
        cache_m_time: Option<u64>,
        now_ms: u64,
    ) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::Empty;
        }
        let requests = std::mem::take(&mut self.pending);
        let count = requests.len();
        let bulk = RequestEnvelope {
            rec_id,
            id,
            cache_m_time,
            undo_redo: None,
            request: EditRequest::ApplyBulkUpdates {
                requests_to_apply: requests,
            },
        };

        let result = transport.send(&bulk);
        self.dirty = false;
        self.last_completed_ms = now_ms;

        match result {
            Ok(response) => {
                if response.result_code.is_success() {
                    debug!(%id, count, code = %response.result_code, "bulk update sent");
                } else {
                    warn!(%id, count, code = %response.result_code, "bulk update rejected");
                }
                FlushOutcome::Sent(response)
            }
            Err(e) => {
                warn!(%id, count, error = %e, "bulk update failed, changes not retried");
                FlushOutcome::Failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibedit_core::{Response, ResultCode};

    #[derive(Default)]
    struct Recording {
        sent: Vec<RequestEnvelope>,
        fail: bool,
        code: ResultCode,
    }

    impl Transport for Recording {
        fn send(&mut self, request: &RequestEnvelope) -> Result<Response, TransportError> {
            self.sent.push(request.clone());
            if self.fail {
                Err(TransportError::Timeout)
            } else {
                Ok(Response {
                    result_code: self.code,
                    ..Response::default()
                })
            }
        }
    }

    fn request(id: u64, value: &str) -> RequestEnvelope {
        RequestEnvelope {
            rec_id: Some(RecId(1)),
            id: TransactionId(id),
            cache_m_time: None,
            undo_redo: None,
            request: EditRequest::ModifyContent {
                tag: "245".into(),
                field_position: 0,
                subfield_index: Some(0),
                value: value.into(),
            },
        }
    }

    #[test]
    fn three_requests_one_bulk() {
        let mut queue = RequestQueue::new(5_000);
        let mut transport = Recording::default();
        for (i, v) in ["a", "b", "c"].iter().enumerate() {
            queue.enqueue(&request(i as u64 + 1, v));
        }
        assert!(queue.is_dirty());

        let outcome = queue.flush(&mut transport, Some(RecId(1)), TransactionId(4), None, 100);
        assert!(matches!(outcome, FlushOutcome::Sent(_)));
        assert_eq!(transport.sent.len(), 1);
        let EditRequest::ApplyBulkUpdates { requests_to_apply } = &transport.sent[0].request
        else {
            panic!("expected bulk request");
        };
        let ids: Vec<_> = requests_to_apply.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert!(!queue.is_dirty());
        assert_eq!(queue.last_completed_ms(), 100);
    }

    #[test]
    fn failure_clears_without_retry() {
        let mut queue = RequestQueue::new(5_000);
        let mut transport = Recording {
            fail: true,
            ..Recording::default()
        };
        queue.enqueue(&request(1, "a"));
        let outcome = queue.flush(&mut transport, None, TransactionId(2), None, 50);
        assert!(matches!(outcome, FlushOutcome::Failed(TransportError::Timeout)));
        assert!(queue.is_empty());
        assert_eq!(queue.last_completed_ms(), 50);
        assert!(matches!(
            queue.flush(&mut transport, None, TransactionId(3), None, 60),
            FlushOutcome::Empty
        ));
        assert_eq!(transport.sent.len(), 1);
    }

    #[test]
    fn rejected_bulk_is_still_done() {
        let mut queue = RequestQueue::new(5_000);
        let mut transport = Recording {
            code: ResultCode::INVALID_CONTENT,
            ..Recording::default()
        };
        queue.enqueue(&request(1, "a"));
        let outcome = queue.flush(&mut transport, None, TransactionId(2), None, 70);
        let FlushOutcome::Sent(response) = outcome else {
            panic!("expected a response");
        };
        assert!(!response.result_code.is_success());
        assert!(queue.is_empty());
        assert_eq!(transport.sent.len(), 1);
    }

    #[test]
    fn auto_flush_needs_more_than_interval() {
        let mut queue = RequestQueue::new(5_000);
        assert!(!queue.should_auto_flush(10_000));
        queue.enqueue(&request(1, "a"));
        assert!(!queue.should_auto_flush(5_000));
        assert!(queue.should_auto_flush(5_001));
    }
}

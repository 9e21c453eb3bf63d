// Re-export modules for the binary and the integration tests
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;
pub mod transport;

// Re-export main types for convenience
pub use error::{Result, SyncError, ValidationError};
pub use models::*;
pub use sync::SyncEngine;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_transitions() {
        use MessageState::*;
        assert!(Queued.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        // receipts may skip Delivered
        assert!(Sent.can_transition_to(Read));

        assert!(!Queued.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Sent.can_transition_to(Failed));
    }

    #[test]
    fn test_failed_only_leaves_through_retry() {
        use MessageState::*;
        assert!(Sending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Sending));
        assert!(Failed.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Failed.can_transition_to(Read));
    }

    #[test]
    fn test_stale_updates() {
        use MessageState::*;
        assert!(Read.is_stale(Delivered));
        assert!(Delivered.is_stale(Delivered));
        assert!(!Sent.is_stale(Delivered));
        assert!(Failed.is_stale(Failed));
        assert!(!Failed.is_stale(Sending));
    }

    #[test]
    fn test_rejected_message_is_not_retryable() {
        let mut message = Message {
            id: "tmp-1".to_string(),
            conversation_id: "c1".to_string(),
            sender_id: "me".to_string(),
            text: "hello".to_string(),
            timestamp: 1,
            state: MessageState::Failed,
            error: Some(MessageError::timeout("no ack")),
        };
        assert!(message.is_retryable());

        message.error = Some(MessageError::rejected("blocked"));
        assert!(message.is_failed());
        assert!(!message.is_retryable());

        message.state = MessageState::Sending;
        assert!(!message.is_retryable());
    }

    #[test]
    fn test_queued_message_record_fields() {
        let entry = QueuedMessage {
            temp_id: "tmp-1".to_string(),
            conversation_id: "c1".to_string(),
            text: "hi".to_string(),
            enqueued_at: 42,
            attempt: 2,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tempId"], "tmp-1");
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["attempt"], 2);
    }
}

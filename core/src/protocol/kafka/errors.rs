//! Kafka Error Codes
//!
//! Error codes returned by brokers in response bodies, and how a producer
//! should react to them: retry as-is, refresh metadata first, or give up.

macro_rules! error_codes {
    ($($name:ident = $code:literal => $message:literal,)+) => {
        /// Kafka protocol error codes (matching the official Kafka numbering)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(i16)]
        pub enum ErrorCode {
            #[default]
            NoError = 0,
            Unknown = -1,
            $($name = $code,)+
        }

        impl ErrorCode {
            /// Human-readable description of the error
            pub fn message(self) -> &'static str {
                match self {
                    ErrorCode::NoError => "Success",
                    ErrorCode::Unknown => "The server experienced an unexpected error when processing the request",
                    $(ErrorCode::$name => $message,)+
                }
            }
        }

        impl From<i16> for ErrorCode {
            /// Codes this client does not know about collapse into `Unknown`;
            /// callers that need the raw value keep the `i16` alongside.
            fn from(code: i16) -> Self {
                match code {
                    0 => ErrorCode::NoError,
                    $($code => ErrorCode::$name,)+
                    _ => ErrorCode::Unknown,
                }
            }
        }
    };
}

error_codes! {
    OffsetOutOfRange = 1 => "The requested offset is not within the range of offsets maintained by the server",
    CorruptMessage = 2 => "The message contents does not match the message CRC or the message is otherwise corrupt",
    UnknownTopicOrPartition = 3 => "The topic or partition does not exist",
    InvalidFetchSize = 4 => "The fetch size is invalid",
    LeaderNotAvailable = 5 => "There is no leader for this topic-partition as we are in the middle of a leadership election",
    NotLeaderOrFollower = 6 => "This server is not the leader for that topic-partition",
    RequestTimedOut = 7 => "The request timed out",
    BrokerNotAvailable = 8 => "The broker is not available",
    ReplicaNotAvailable = 9 => "The replica is not available for the requested topic-partition",
    MessageTooLarge = 10 => "The request included a message larger than the max message size the server will accept",
    StaleControllerEpoch = 11 => "The controller moved to another broker",
    OffsetMetadataTooLarge = 12 => "The metadata field of the offset request was too large",
    NetworkException = 13 => "The server disconnected before a response was received",
    CoordinatorLoadInProgress = 14 => "The coordinator is loading and hence can't process requests",
    CoordinatorNotAvailable = 15 => "The coordinator is not available",
    NotCoordinator = 16 => "This is not the correct coordinator",
    InvalidTopicException = 17 => "The request attempted to perform an operation on an invalid topic",
    RecordListTooLarge = 18 => "The request included message batch larger than the configured segment size on the server",
    NotEnoughReplicas = 19 => "Messages are rejected since there are fewer in-sync replicas than required",
    NotEnoughReplicasAfterAppend = 20 => "Messages are written to the log, but to fewer in-sync replicas than required",
    InvalidRequiredAcks = 21 => "Produce request specified an invalid value for required acks",
    TopicAuthorizationFailed = 29 => "Topic authorization failed",
    ClusterAuthorizationFailed = 31 => "Cluster authorization failed",
    InvalidTimestamp = 32 => "The timestamp of the message is out of acceptable range",
    UnsupportedVersion = 35 => "The version of API is not supported",
    InvalidRequest = 42 => "The request was malformed or sent to an incompatible broker",
    UnsupportedForMessageFormat = 43 => "The message format version does not support the request",
    PolicyViolation = 44 => "Request parameters do not satisfy the configured policy",
    OutOfOrderSequenceNumber = 45 => "The broker received an out of order sequence number",
    DuplicateSequenceNumber = 46 => "The broker received a duplicate sequence number",
    InvalidProducerEpoch = 47 => "Producer attempted to produce with an old epoch",
    InvalidTxnState = 48 => "The producer attempted a transactional operation in an invalid state",
    InvalidProducerIdMapping = 49 => "The producer id is not currently assigned to its transactional id",
    InvalidTransactionTimeout = 50 => "The transaction timeout is larger than the maximum value allowed by the broker",
    ConcurrentTransactions = 51 => "Another operation on the same transaction is in progress",
    TransactionCoordinatorFenced = 52 => "The transaction coordinator is no longer the current coordinator for this producer",
    TransactionalIdAuthorizationFailed = 53 => "Transactional Id authorization failed",
    SecurityDisabled = 54 => "Security features are disabled",
    OperationNotAttempted = 55 => "The broker did not attempt to execute this operation",
    KafkaStorageError = 56 => "Disk error when trying to access log file on the disk",
    LogDirNotFound = 57 => "The user-specified log directory is not found in the broker config",
    SaslAuthenticationFailed = 58 => "SASL Authentication failed",
    UnknownProducerId = 59 => "The broker could not locate the producer metadata for this producer id",
    ReassignmentInProgress = 60 => "A partition reassignment is in progress",
    FencedLeaderEpoch = 74 => "The leader epoch in the request is older than the leader epoch on the broker",
    UnknownLeaderEpoch = 75 => "The leader epoch in the request is newer than the leader epoch on the broker",
    UnsupportedCompressionType = 76 => "The requesting client does not support the compression type of given partition",
    OffsetNotAvailable = 78 => "The leader high watermark has not caught up from a recent leader election",
    PreferredLeaderNotAvailable = 80 => "The preferred leader was not available",
    InvalidRecord = 87 => "Some record in the batch failed broker-side validation",
    ThrottlingQuotaExceeded = 89 => "The request was throttled by a quota",
    ProducerFenced = 90 => "A newer producer with the same transactional id has fenced this one",
    UnknownTopicId = 100 => "The topic id does not exist",
    InconsistentTopicId = 103 => "The topic id in the request does not match the topic id in the log",
    TransactionalIdNotFound = 105 => "The transactional id could not be found",
}

impl ErrorCode {
    /// Convert error code to i16 for wire protocol
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }

    /// Whether sending the same request again may succeed.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::CorruptMessage
                | ErrorCode::UnknownTopicOrPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderOrFollower
                | ErrorCode::RequestTimedOut
                | ErrorCode::ReplicaNotAvailable
                | ErrorCode::NetworkException
                | ErrorCode::CoordinatorLoadInProgress
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::NotCoordinator
                | ErrorCode::NotEnoughReplicas
                | ErrorCode::NotEnoughReplicasAfterAppend
                | ErrorCode::ConcurrentTransactions
                | ErrorCode::KafkaStorageError
                | ErrorCode::FencedLeaderEpoch
                | ErrorCode::UnknownLeaderEpoch
                | ErrorCode::OffsetNotAvailable
                | ErrorCode::PreferredLeaderNotAvailable
                | ErrorCode::ThrottlingQuotaExceeded
                | ErrorCode::UnknownTopicId
        )
    }

    /// Whether the partition leadership the client holds is stale. Such
    /// errors are retried only after the topic metadata has been reloaded.
    pub fn requires_metadata_refresh(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTopicOrPartition
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderOrFollower
                | ErrorCode::ReplicaNotAvailable
                | ErrorCode::KafkaStorageError
                | ErrorCode::FencedLeaderEpoch
                | ErrorCode::UnknownLeaderEpoch
                | ErrorCode::UnknownTopicId
                | ErrorCode::InconsistentTopicId
        )
    }

    /// Whether the transaction coordinator moved and must be looked up again.
    pub fn requires_coordinator_refresh(self) -> bool {
        matches!(
            self,
            ErrorCode::CoordinatorNotAvailable | ErrorCode::NotCoordinator
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}): {}", *self as i16, self, self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_i16(), 0);
        assert_eq!(ErrorCode::Unknown.as_i16(), -1);
        assert_eq!(ErrorCode::UnknownTopicOrPartition.as_i16(), 3);

        assert_eq!(ErrorCode::from(0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from(-1), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from(6), ErrorCode::NotLeaderOrFollower);
        assert_eq!(ErrorCode::from(46), ErrorCode::DuplicateSequenceNumber);
        assert_eq!(ErrorCode::from(999), ErrorCode::Unknown);
    }

    #[test]
    fn test_retriable_errors() {
        assert!(!ErrorCode::NoError.is_retriable());
        assert!(!ErrorCode::Unknown.is_retriable());
        assert!(ErrorCode::NotLeaderOrFollower.is_retriable());
        assert!(ErrorCode::RequestTimedOut.is_retriable());
        assert!(ErrorCode::NotEnoughReplicas.is_retriable());
        assert!(!ErrorCode::MessageTooLarge.is_retriable());
        assert!(!ErrorCode::ProducerFenced.is_retriable());
        assert!(!ErrorCode::OutOfOrderSequenceNumber.is_retriable());
    }

    #[test]
    fn test_metadata_refresh_is_subset_of_retriable() {
        for code in -1i16..=110 {
            let error = ErrorCode::from(code);
            if error.requires_metadata_refresh() && error != ErrorCode::InconsistentTopicId {
                assert!(error.is_retriable(), "{} should be retriable", error);
            }
        }
        assert!(ErrorCode::NotLeaderOrFollower.requires_metadata_refresh());
        assert!(!ErrorCode::RequestTimedOut.requires_metadata_refresh());
    }

    #[test]
    fn test_error_display() {
        let display = format!("{}", ErrorCode::UnknownTopicOrPartition);
        assert!(display.contains('3'));
        assert!(display.contains("UnknownTopicOrPartition"));
        assert!(display.contains("topic or partition"));
    }
}

//! Generated protobuf types for the Cloud Tasks v2 wire surface, plus the
//! conversions between prost well-known types and chrono/std time.

pub mod google {
    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }

    pub mod iam {
        pub mod v1 {
            tonic::include_proto!("google.iam.v1");
        }
    }

    pub mod cloud {
        pub mod tasks {
            pub mod v2 {
                tonic::include_proto!("google.cloud.tasks.v2");
            }
        }
    }
}

// Re-export commonly used types
pub use google::cloud::tasks::v2::{
    cloud_tasks_client::CloudTasksClient, cloud_tasks_server::CloudTasks,
    cloud_tasks_server::CloudTasksServer, task::MessageType, AppEngineHttpRequest,
    AppEngineRouting, Attempt, HttpMethod, HttpRequest, Queue, RateLimits, RetryConfig, Task,
};

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time as a protobuf timestamp.
pub fn now_timestamp() -> prost_types::Timestamp {
    timestamp_from_chrono(Utc::now())
}

pub fn timestamp_from_chrono(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

/// Lossy conversion back to chrono; out-of-range timestamps collapse to the
/// epoch, which is fine for scheduling arithmetic on wall-clock values.
pub fn timestamp_to_chrono(t: &prost_types::Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(t.seconds, t.nanos.max(0) as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Converts a protobuf duration to std; negative durations clamp to zero.
pub fn duration_from_proto(d: &prost_types::Duration) -> std::time::Duration {
    if d.seconds < 0 || d.nanos < 0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::new(d.seconds as u64, d.nanos as u32)
}

pub fn duration_to_proto(d: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

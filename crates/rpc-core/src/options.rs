use std::time::Duration;

use crate::message::PriorityBands;

/// Configuration for a [`crate::processor::Processor`]. Application-level
/// config loading (files, env, flags) is out of scope; this is a plain
/// struct the embedder constructs.
#[derive(Clone, Debug)]
pub struct ProcessorOptions {
    /// Largest encoded frame accepted or produced. Exceeding it on send is a
    /// fatal out-of-memory condition.
    pub max_message_length: usize,
    /// Ingress queue capacity (`C_in`).
    pub ingress_capacity: usize,
    /// Ingress worker parallelism (`W_in`).
    pub ingress_workers: usize,
    /// Egress queue capacity.
    pub egress_capacity: usize,
    /// Outbound request send-stage parallelism.
    pub request_queue_size: usize,
    pub request_workers: usize,
    /// Inbound call queue capacity and parallelism.
    pub call_queue_size: usize,
    pub call_workers: usize,
    /// `0` disables streams entirely.
    pub max_stream_count: usize,
    pub use_scopes: bool,
    pub flush_stream: bool,
    /// Escalate `InvocationError` to a fatal session shutdown.
    pub disconnect_on_api_error: bool,
    pub compression_buffer_size: usize,
    pub priorities: PriorityBands,
    pub rpc_version: u8,
    pub heartbeat_interval: Option<Duration>,
    /// Maximum bytes carried by a single `StreamChunk`; a shorter chunk
    /// denotes end-of-stream. Any chunk above this is a fatal protocol
    /// violation.
    pub max_chunk_size: usize,
    /// Whether the egress writer flushes the transport after every message.
    pub flush_after_each: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            max_message_length: 16 * 1024 * 1024,
            ingress_capacity: 256,
            ingress_workers: 4,
            egress_capacity: 256,
            request_queue_size: 64,
            request_workers: 8,
            call_queue_size: 64,
            call_workers: 8,
            max_stream_count: 256,
            use_scopes: true,
            flush_stream: true,
            disconnect_on_api_error: false,
            compression_buffer_size: 64 * 1024,
            priorities: PriorityBands::default(),
            rpc_version: 1,
            heartbeat_interval: None,
            max_chunk_size: 64 * 1024,
            flush_after_each: true,
        }
    }
}

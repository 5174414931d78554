// src/core/mod.rs

// Root of the orchestration engine: everything stateful lives under here,
// the binary entry point only wires CLI parsing and logging to `orchestrate`.

/// Data structures shared across the engine: module lifecycle records,
/// service metadata, engagement errors, and operator choice enums.
pub mod models;

/// The load-reconcile-mutate-save persistence cycle for per-host state,
/// including the crash-recovery rewrite of stale RUNNING markers.
pub mod state;

/// Raw target resolution (IP literals, gated CIDR expansion) and the
/// fail-closed scope policy for derived targets.
pub mod scope;

/// Admission-gated external command execution and the per-engagement tool
/// inventory.
pub mod executor;

/// The per-host scan pipeline and its five resumable modules.
pub mod scanner;

/// Engagement setup, target fan-out, and host-level concurrency bounds.
pub mod orchestrator;

/// Summary rendering over the per-host terminal artifacts.
pub mod reporting;

//! Proc-ID generation, injectable so the spec builder is deterministic in
//! tests. Mirrors the "fixed proc-ID generator" the spec requires for
//! byte-identical `Describe` output.
use std::sync::atomic::{AtomicU64, Ordering};

pub trait ProcIdGenerator: std::fmt::Debug {
    fn next_id(&self) -> String;
}

/// Random, UUID-based generator used outside of tests.
#[derive(Debug, Default)]
pub struct RandomProcIdGenerator;

impl ProcIdGenerator for RandomProcIdGenerator {
    fn next_id(&self) -> String {
        format!("proc_{}", uuid::Uuid::new_v4().simple())
    }
}

/// Sequential generator (`proc_0`, `proc_1`, ...) for deterministic tests.
#[derive(Debug, Default)]
pub struct SequentialProcIdGenerator {
    next: AtomicU64,
}

impl ProcIdGenerator for SequentialProcIdGenerator {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("proc_{n}")
    }
}

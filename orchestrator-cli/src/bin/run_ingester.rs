//! Log/event ingestion is out of scope for this orchestrator (see
//! `SPEC_FULL.md` §6); this binary exists only so the CLI surface documents
//! that boundary instead of silently omitting the entry point.

fn main() {
    println!("run-ingester: out of scope");
}

// Must not compile: a process still stopped at exec has no `release`;
// its cgroup membership has to be decided first.

use tamarun::exec::lifecycle::{Started, TracedProcess};

fn release_early(process: TracedProcess<Started>) {
    let _ = process.release();
}

fn main() {}

// Must not compile: every transition consumes the previous state.

use tamarun::exec::lifecycle::{Started, TracedProcess};

fn settle_twice(process: TracedProcess<Started>) {
    let _assigned = process.skip_cgroup();
    let _again = process.skip_cgroup();
}

fn main() {}

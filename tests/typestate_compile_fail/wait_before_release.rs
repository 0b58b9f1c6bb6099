// Must not compile: waiting on a traced process would block forever on the
// exec stop; only a released process can be waited on.

use tamarun::exec::lifecycle::{GroupAssigned, TracedProcess};

fn wait_while_traced(process: TracedProcess<GroupAssigned>) {
    let _ = process.wait(None);
}

fn main() {}

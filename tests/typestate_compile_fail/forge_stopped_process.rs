// Must not compile: only the spawner hands out processes stopped at exec.

use tamarun::exec::lifecycle::{Started, TracedProcess};

fn forge(pid: nix::unistd::Pid) -> TracedProcess<Started> {
    TracedProcess::stopped_at_exec(pid)
}

fn main() {}

//! ユニットテスト用: シグナルを待ち続ける子プロセス

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pause, ForkResult, Pid};

pub(crate) struct PausedChild {
    pid: Pid,
}

impl PausedChild {
    pub(crate) fn spawn() -> Self {
        match unsafe { fork() }.expect("Failed to fork") {
            ForkResult::Child => loop {
                pause();
            },
            ForkResult::Parent { child } => Self { pid: child },
        }
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl Drop for PausedChild {
    fn drop(&mut self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

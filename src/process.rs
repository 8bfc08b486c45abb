//! Writing to the process's own standard streams.
//!
//! Stdout and stderr aren't part of the registered fixed-buffer pool (§4.2),
//! so these go through the vectored user-buffer path (`writev`) rather than
//! `write_fixed`.

use crate::runtime::ops;
use crate::IoResult;

const STDOUT: std::os::fd::RawFd = 1;
const STDERR: std::os::fd::RawFd = 2;

/// Writes `s` to the process's stdout, retrying on short writes until all of
/// it lands.
pub async fn print(s: &str) -> IoResult<()> {
    ops::write_all(STDOUT, s.as_bytes(), None, false).await
}

/// Writes `s` to the process's stderr, retrying on short writes until all of
/// it lands.
pub async fn eprint(s: &str) -> IoResult<()> {
    ops::write_all(STDERR, s.as_bytes(), None, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    #[test]
    fn print_writes_to_stdout() {
        runtime::block_on(async {
            print("").await.unwrap();
        });
    }

    #[test]
    fn eprint_writes_to_stderr() {
        runtime::block_on(async {
            eprint("").await.unwrap();
        });
    }
}

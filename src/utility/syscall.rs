use rustix::io::Errno;

use crate::error::Error;

// Linux reserves -1 through -4095 for errors. See
// https://sourceware.org/git/?p=glibc.git;a=blob;f=sysdeps/unix/sysv/linux/x86_64/sysdep.h;h=24d8b8ec20a55824a4806f8821ecba2622d0fe8e;hb=HEAD#l41
const MAX_ERRNO: i64 = 4095;

// Kernel-internal errnos which "should never be seen by user programs", but
// are visible at syscall-exit stops of a traced thread.
pub const ERESTARTSYS: i32 = 512;
pub const ERESTARTNOINTR: i32 = 513;
pub const ERESTARTNOHAND: i32 = 514;

/// Decodes the raw value of the return register of a syscall.
pub fn raw_return_value_to_result(rv: u64) -> Result<u64, Errno> {
    let rv = rv as i64;
    if rv <= -1 && rv >= -MAX_ERRNO {
        return Err(Errno::from_raw_os_error(-rv as i32));
    }
    Ok(rv as u64)
}

/// Whether `errno` asks for the syscall to be restarted.
pub fn is_restart_errno(errno: Errno) -> bool {
    matches!(
        errno.raw_os_error(),
        ERESTARTSYS | ERESTARTNOINTR | ERESTARTNOHAND
    )
}

/// Runs `f` until it yields something other than a syscall failure with a
/// restart errno. Any other result, including other errnos and fatal errors,
/// is returned unchanged.
pub fn retry_on_restart<T>(mut f: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    loop {
        match f() {
            Err(Error::Syscall(e)) if is_restart_errno(e) => {
                log::trace!("Restarting injected syscall after {}", e.raw_os_error());
                continue;
            }
            res => return res,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::error::FatalError;

    #[test]
    fn test_return_value_decoding() {
        assert_eq!(raw_return_value_to_result(0), Ok(0));
        assert_eq!(raw_return_value_to_result(0x7f00_0000_1000), Ok(0x7f00_0000_1000));
        assert_eq!(
            raw_return_value_to_result(-(libc::ENOMEM as i64) as u64),
            Err(Errno::NOMEM)
        );
        assert_eq!(
            raw_return_value_to_result(-4095i64 as u64).unwrap_err().raw_os_error(),
            4095
        );
        // Just outside the error range; e.g. a high mmap address.
        assert_eq!(raw_return_value_to_result(-4096i64 as u64), Ok(-4096i64 as u64));
    }

    #[test]
    fn test_restart_errnos() {
        for raw in [ERESTARTSYS, ERESTARTNOINTR, ERESTARTNOHAND] {
            assert!(is_restart_errno(Errno::from_raw_os_error(raw)));
        }
        assert!(!is_restart_errno(Errno::INTR));
        assert!(!is_restart_errno(Errno::AGAIN));
        assert!(!is_restart_errno(Errno::from_raw_os_error(515)));
    }

    #[test]
    fn test_retry_only_on_restart_errnos() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let restarts = rng.gen_range(0..5);
            let final_errno = loop {
                let raw = rng.gen_range(1..600);
                if !is_restart_errno(Errno::from_raw_os_error(raw)) {
                    break Errno::from_raw_os_error(raw);
                }
            };

            let mut calls = 0;
            let res: Result<u64, Error> = retry_on_restart(|| {
                calls += 1;
                if calls <= restarts {
                    let raw = [ERESTARTSYS, ERESTARTNOINTR, ERESTARTNOHAND][calls % 3];
                    Err(Error::Syscall(Errno::from_raw_os_error(raw)))
                } else {
                    Err(Error::Syscall(final_errno))
                }
            });
            assert_eq!(calls, restarts + 1);
            assert!(matches!(res, Err(Error::Syscall(e)) if e == final_errno));
        }
    }

    #[test]
    fn test_retry_passes_through_success_and_fatal() {
        let mut calls = 0;
        let res = retry_on_restart(|| {
            calls += 1;
            if calls == 1 {
                Err(Error::Syscall(Errno::from_raw_os_error(ERESTARTSYS)))
            } else {
                Ok(7u64)
            }
        });
        assert_eq!(res.unwrap(), 7);

        let res: Result<u64, Error> =
            retry_on_restart(|| Err(FatalError::UnexpectedStop { tid: 1, status: 0 }.into()));
        assert!(res.unwrap_err().is_fatal());
    }
}

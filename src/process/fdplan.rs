//! Planning of the child's file-descriptor table rewrite.
//!
//! After the standard streams are staged onto 0/1/2 the child must end up
//! with exactly the requested descriptors at slots 3..=9 and nothing
//! above 9 except the error-report pipe at slot 10 and, when the program
//! is given as a descriptor, the program at slot 11 (both close-on-exec).
//!
//! The plan is computed in the parent as pure integer juggling; the
//! child executes it with nothing but `dup2`/`close`/`fcntl`/
//! `close_range`, which keeps the post-fork path async-signal-safe.

use std::os::unix::io::RawFd;

pub(crate) const REPORT_SLOT: RawFd = 10;
pub(crate) const PROGRAM_SLOT: RawFd = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Dup2 { src: RawFd, dst: RawFd },
    Close { fd: RawFd },
    Cloexec { fd: RawFd },
    CloseRange { first: u32 },
}

/// Lowest slot >= `from` for which `busy` is false.
fn lowest_free_slot(from: &mut RawFd, busy: impl Fn(RawFd) -> bool) -> RawFd {
    loop {
        let candidate = *from;
        *from += 1;
        if !busy(candidate) {
            return candidate;
        }
    }
}

/// Computes the rewrite steps.
///
/// `extra_fds` maps destination slots in 3..=9 to source descriptors as
/// they exist in the parent. Sources living inside the destination range
/// (or on the reserved slots) are first relocated to free slots >= 10 so
/// no `dup2` can destroy a source that is still needed.
pub(crate) fn rewrite_plan(
    extra_fds: &[(RawFd, RawFd)],
    report: RawFd,
    program: Option<RawFd>,
) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut report = report;
    let mut program = program;
    let mut extras: Vec<(RawFd, RawFd)> = extra_fds.to_vec();
    let mut from = REPORT_SLOT;

    // Relocate every source currently inside [0, 10).
    if report < REPORT_SLOT {
        let dst = {
            let program = program;
            let extras = extras.clone();
            lowest_free_slot(&mut from, |fd| {
                Some(fd) == program || extras.iter().any(|(_, src)| *src == fd)
            })
        };
        steps.push(Step::Dup2 { src: report, dst });
        report = dst;
    }

    if let Some(p) = program {
        if p < REPORT_SLOT {
            // Slot 10 stays off-limits here: the report pipe parks there
            // before the program descriptor is consumed.
            let dst = {
                let extras = extras.clone();
                lowest_free_slot(&mut from, |fd| {
                    fd == report
                        || fd == REPORT_SLOT
                        || extras.iter().any(|(_, src)| *src == fd)
                })
            };
            steps.push(Step::Dup2 { src: p, dst });
            program = Some(dst);
        }
    }

    for i in 0..extras.len() {
        let (_, src) = extras[i];
        if src > 9 {
            continue;
        }
        let dst = {
            let program = program;
            let others = extras.clone();
            lowest_free_slot(&mut from, |fd| {
                fd == report
                    || Some(fd) == program
                    || others.iter().any(|(_, other)| *other == fd)
            })
        };
        steps.push(Step::Dup2 { src, dst });
        extras[i].1 = dst;
    }

    // Now the destructive pass over [3, 10).
    for slot in 3..REPORT_SLOT {
        match extras.iter().find(|(dst, _)| *dst == slot) {
            Some((_, src)) => steps.push(Step::Dup2 { src: *src, dst: slot }),
            None => steps.push(Step::Close { fd: slot }),
        }
    }

    // Park the reserved descriptors and mark them close-on-exec.
    if report != REPORT_SLOT {
        steps.push(Step::Dup2 {
            src: report,
            dst: REPORT_SLOT,
        });
    }
    steps.push(Step::Cloexec { fd: REPORT_SLOT });

    if let Some(p) = program {
        if p != PROGRAM_SLOT {
            steps.push(Step::Dup2 {
                src: p,
                dst: PROGRAM_SLOT,
            });
        }
        steps.push(Step::Cloexec { fd: PROGRAM_SLOT });
    }

    steps.push(Step::CloseRange {
        first: if program.is_some() {
            (PROGRAM_SLOT + 1) as u32
        } else {
            PROGRAM_SLOT as u32
        },
    });

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn no_extras_closes_the_whole_range() {
        let steps = rewrite_plan(&[], 20, None);
        assert_eq!(
            steps,
            vec![
                Step::Close { fd: 3 },
                Step::Close { fd: 4 },
                Step::Close { fd: 5 },
                Step::Close { fd: 6 },
                Step::Close { fd: 7 },
                Step::Close { fd: 8 },
                Step::Close { fd: 9 },
                Step::Dup2 { src: 20, dst: 10 },
                Step::Cloexec { fd: 10 },
                Step::CloseRange { first: 11 },
            ]
        );
    }

    #[test]
    fn swapped_sources_are_relocated_before_the_destructive_pass() {
        // fd 5 must land on 3 and fd 3 on 5; neither may be destroyed
        // before it was copied out of the way.
        let steps = rewrite_plan(&[(3, 5), (5, 3)], 20, None);
        assert_eq!(
            steps,
            vec![
                Step::Dup2 { src: 5, dst: 10 },
                Step::Dup2 { src: 3, dst: 11 },
                Step::Dup2 { src: 10, dst: 3 },
                Step::Close { fd: 4 },
                Step::Dup2 { src: 11, dst: 5 },
                Step::Close { fd: 6 },
                Step::Close { fd: 7 },
                Step::Close { fd: 8 },
                Step::Close { fd: 9 },
                Step::Dup2 { src: 20, dst: 10 },
                Step::Cloexec { fd: 10 },
                Step::CloseRange { first: 11 },
            ]
        );
    }

    #[test]
    fn report_pipe_inside_range_is_moved_to_a_free_slot() {
        // Slot 10 is taken by an extra source, so the report pipe must
        // skip past it.
        let steps = rewrite_plan(&[(4, 10)], 7, None);
        assert_eq!(steps[0], Step::Dup2 { src: 7, dst: 11 });
        assert!(steps.contains(&Step::Dup2 { src: 10, dst: 4 }));
        assert!(steps.contains(&Step::Dup2 { src: 11, dst: 10 }));
        assert_eq!(*steps.last().unwrap(), Step::CloseRange { first: 11 });
    }

    #[test]
    fn program_fd_parks_on_slot_eleven() {
        let steps = rewrite_plan(&[], 20, Some(5));
        // Slot 10 belongs to the report pipe, so the program relocates
        // straight to 11 and the final parking dup is elided.
        assert_eq!(steps[0], Step::Dup2 { src: 5, dst: 11 });
        assert!(!steps.contains(&Step::Dup2 { src: 11, dst: 11 }));
        assert!(steps.contains(&Step::Dup2 { src: 20, dst: 10 }));
        assert!(steps.contains(&Step::Cloexec { fd: 11 }));
        assert_eq!(*steps.last().unwrap(), Step::CloseRange { first: 12 });
    }
}

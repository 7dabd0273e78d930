//! Subprocess spawning.
//!
//! [`SpawnOptions`] describes the child: program (path, `PATH` lookup or
//! an executable descriptor), argv/envp, standard streams, extra
//! descriptors at slots 3..=9, scheduler class, session/terminal
//! control, credentials, namespaces. `spawn` forks, runs the pre-exec
//! sequencer in the child (a fixed order of async-signal-safe steps) and
//! execs; any failure between fork and exec is reported back as a 4-byte
//! `errno` on a close-on-exec pipe, so the parent distinguishes "exec
//! happened" (EOF) from "step N failed" precisely.
//!
//! The returned [`Child`] owns a pidfd. Waiting is a single-shot
//! readiness wait on it, interruptible like any other suspending
//! operation; dropping an un-awaited child signals it and schedules a
//! non-blocking reap.

use std::cell::Cell;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::stream;
use crate::vm::{current_vm, PendingOperation, VmContext};

mod fdplan;

use fdplan::{Step, PROGRAM_SLOT, REPORT_SLOT};

// Highest signal number we reset to default in the child.
const SIGNAL_MAX: libc::c_int = 64;

////////////////////////////////////////////////////////////////////////////////
// Options
////////////////////////////////////////////////////////////////////////////////

/// How the program to execute is designated. Exactly one form.
pub enum Program {
    /// An explicit path, absolute or relative; no `PATH` lookup.
    Path(CString),
    /// A name resolved through `PATH` (`execvpe`).
    Lookup(CString),
    /// An executable descriptor (`fexecve`).
    Fd(OwnedFd),
}

/// What a standard stream of the child is wired to.
pub enum Stdio {
    /// Share the parent's descriptor.
    Inherit,
    /// A specific descriptor, dup2'ed onto the slot.
    Fd(RawFd),
    /// No stream: the slot receives one end of a fresh pipe whose other
    /// end dies on exec, so reads see EOF and writes see EPIPE.
    Null,
}

/// The stream whose terminal is put in the foreground.
#[derive(Clone, Copy)]
pub enum Foreground {
    Stdin,
    Stdout,
    Stderr,
    Fd(RawFd),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicy {
    Other,
    Fifo,
    RoundRobin,
    Batch,
    Idle,
}

impl SchedulerPolicy {
    fn raw(self) -> libc::c_int {
        match self {
            Self::Other => libc::SCHED_OTHER,
            Self::Fifo => libc::SCHED_FIFO,
            Self::RoundRobin => libc::SCHED_RR,
            Self::Batch => libc::SCHED_BATCH,
            Self::Idle => libc::SCHED_IDLE,
        }
    }
}

/// Subprocess configuration, consumed by [`SpawnOptions::spawn`].
pub struct SpawnOptions {
    program: Program,
    arg0: Option<CString>,
    arguments: Vec<CString>,
    environment: Option<Vec<CString>>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    extra_fds: Vec<(RawFd, RawFd)>,
    scheduler_policy: Option<SchedulerPolicy>,
    scheduler_priority: Option<libc::c_int>,
    scheduler_reset_on_fork: bool,
    start_new_session: bool,
    set_ctty: Option<RawFd>,
    process_group: Option<libc::pid_t>,
    foreground: Option<Foreground>,
    ruid: Option<libc::uid_t>,
    euid: Option<libc::uid_t>,
    rgid: Option<libc::gid_t>,
    egid: Option<libc::gid_t>,
    extra_groups: Option<Vec<libc::gid_t>>,
    umask: Option<libc::mode_t>,
    working_directory: Option<CString>,
    working_directory_fd: Option<RawFd>,
    pdeathsig: Option<libc::c_int>,
    nsenter_user: Option<RawFd>,
    nsenter_mount: Option<RawFd>,
    nsenter_uts: Option<RawFd>,
    nsenter_ipc: Option<RawFd>,
    nsenter_net: Option<RawFd>,
    capabilities: Option<crate::system::Capabilities>,
    kill_on_drop: libc::c_int,
}

impl SpawnOptions {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            arg0: None,
            arguments: Vec::new(),
            environment: None,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
            extra_fds: Vec::new(),
            scheduler_policy: None,
            scheduler_priority: None,
            scheduler_reset_on_fork: false,
            start_new_session: false,
            set_ctty: None,
            process_group: None,
            foreground: None,
            ruid: None,
            euid: None,
            rgid: None,
            egid: None,
            extra_groups: None,
            umask: None,
            working_directory: None,
            working_directory_fd: None,
            pdeathsig: None,
            nsenter_user: None,
            nsenter_mount: None,
            nsenter_uts: None,
            nsenter_ipc: None,
            nsenter_net: None,
            capabilities: None,
            kill_on_drop: libc::SIGKILL,
        }
    }

    pub fn arg0(mut self, arg0: CString) -> Self {
        self.arg0 = Some(arg0);
        self
    }

    pub fn arg(mut self, arg: CString) -> Self {
        self.arguments.push(arg);
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = CString>) -> Self {
        self.arguments.extend(args);
        self
    }

    /// Full environment; without this the parent's environment is
    /// inherited.
    pub fn environment(mut self, env: Vec<CString>) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }

    /// Inherits `src` at descriptor slot `slot` (3..=9) in the child.
    pub fn extra_fd(mut self, slot: RawFd, src: RawFd) -> Self {
        self.extra_fds.push((slot, src));
        self
    }

    pub fn scheduler(mut self, policy: SchedulerPolicy, priority: libc::c_int) -> Self {
        self.scheduler_policy = Some(policy);
        self.scheduler_priority = Some(priority);
        self
    }

    pub fn scheduler_reset_on_fork(mut self, reset: bool) -> Self {
        self.scheduler_reset_on_fork = reset;
        self
    }

    pub fn start_new_session(mut self, yes: bool) -> Self {
        self.start_new_session = yes;
        self
    }

    /// Makes `fd`'s terminal the child's controlling terminal. Requires
    /// [`start_new_session`](Self::start_new_session).
    pub fn set_ctty(mut self, fd: RawFd) -> Self {
        self.set_ctty = Some(fd);
        self
    }

    pub fn process_group(mut self, pgid: libc::pid_t) -> Self {
        self.process_group = Some(pgid);
        self
    }

    /// Puts the child's process group in the foreground of the given
    /// stream's terminal. Requires [`process_group`](Self::process_group)
    /// and excludes [`set_ctty`](Self::set_ctty).
    pub fn foreground(mut self, stream: Foreground) -> Self {
        self.foreground = Some(stream);
        self
    }

    pub fn uids(mut self, ruid: Option<libc::uid_t>, euid: Option<libc::uid_t>) -> Self {
        self.ruid = ruid;
        self.euid = euid;
        self
    }

    pub fn gids(mut self, rgid: Option<libc::gid_t>, egid: Option<libc::gid_t>) -> Self {
        self.rgid = rgid;
        self.egid = egid;
        self
    }

    pub fn extra_groups(mut self, groups: Vec<libc::gid_t>) -> Self {
        self.extra_groups = Some(groups);
        self
    }

    pub fn umask(mut self, mask: libc::mode_t) -> Self {
        self.umask = Some(mask);
        self
    }

    pub fn working_directory(mut self, path: CString) -> Self {
        self.working_directory = Some(path);
        self
    }

    pub fn working_directory_fd(mut self, fd: RawFd) -> Self {
        self.working_directory_fd = Some(fd);
        self
    }

    pub fn pdeathsig(mut self, signal: libc::c_int) -> Self {
        self.pdeathsig = Some(signal);
        self
    }

    pub fn nsenter_user(mut self, fd: RawFd) -> Self {
        self.nsenter_user = Some(fd);
        self
    }

    pub fn nsenter_mount(mut self, fd: RawFd) -> Self {
        self.nsenter_mount = Some(fd);
        self
    }

    pub fn nsenter_uts(mut self, fd: RawFd) -> Self {
        self.nsenter_uts = Some(fd);
        self
    }

    pub fn nsenter_ipc(mut self, fd: RawFd) -> Self {
        self.nsenter_ipc = Some(fd);
        self
    }

    pub fn nsenter_net(mut self, fd: RawFd) -> Self {
        self.nsenter_net = Some(fd);
        self
    }

    /// Capability sets installed in the child before exec.
    pub fn capabilities(mut self, caps: crate::system::Capabilities) -> Self {
        self.capabilities = Some(caps);
        self
    }

    /// Signal sent when the child is dropped un-awaited.
    pub fn kill_on_drop(mut self, signal: libc::c_int) -> Self {
        self.kill_on_drop = signal;
        self
    }

    fn validate(&self) -> Result<()> {
        if let (Some(policy), Some(priority)) = (self.scheduler_policy, self.scheduler_priority) {
            let min = unsafe { libc::sched_get_priority_min(policy.raw()) };
            let max = unsafe { libc::sched_get_priority_max(policy.raw()) };
            if min == -1 || max == -1 {
                return Err(Error::last_os_error());
            }
            if priority < min || priority > max {
                return Err(Error::invalid_argument("scheduler.priority"));
            }
        }
        if self.set_ctty.is_some() && !self.start_new_session {
            return Err(Error::invalid_argument("set_ctty"));
        }
        if self.set_ctty.is_some() && self.foreground.is_some() {
            return Err(Error::invalid_argument("foreground"));
        }
        if self.foreground.is_some() && self.process_group.is_none() {
            return Err(Error::invalid_argument("foreground"));
        }
        for (i, (slot, _)) in self.extra_fds.iter().enumerate() {
            if *slot < 3 || *slot > 9 {
                return Err(Error::invalid_argument("extra_fds"));
            }
            if self.extra_fds[..i].iter().any(|(other, _)| other == slot) {
                return Err(Error::invalid_argument("extra_fds"));
            }
        }
        Ok(())
    }

    /// Forks and execs, returning the child handle.
    ///
    /// Must be called from a fiber; the child's reaper becomes a pending
    /// operation of the calling fiber's VM.
    pub fn spawn(self) -> Result<Child> {
        self.validate()?;
        let vm = current_vm();

        // Everything the child touches must be marshaled before fork:
        // the post-fork path may not allocate.
        let (program_path, program_fd, use_path) = match &self.program {
            Program::Path(p) => (Some(p.clone()), None, false),
            Program::Lookup(p) => (Some(p.clone()), None, true),
            Program::Fd(fd) => (None, Some(fd.as_raw_fd()), false),
        };

        let arg0 = match &self.arg0 {
            Some(arg0) => arg0.clone(),
            None => match &program_path {
                Some(p) => p.clone(),
                None => CString::new("program").expect("static arg0"),
            },
        };
        let mut argv_storage = Vec::with_capacity(self.arguments.len() + 1);
        argv_storage.push(arg0);
        argv_storage.extend(self.arguments.iter().cloned());
        let mut argv: Vec<*const libc::c_char> =
            argv_storage.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());

        let env_storage: Vec<CString> = match &self.environment {
            Some(env) => env.clone(),
            None => std::env::vars_os()
                .map(|(mut k, v)| {
                    k.push(OsString::from("="));
                    k.push(v);
                    CString::new(k.as_bytes()).unwrap_or_default()
                })
                .collect(),
        };
        let mut envp: Vec<*const libc::c_char> = env_storage.iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        let mut report_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(report_fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
            return Err(Error::last_os_error());
        }
        let (report_rx, report_tx) = unsafe {
            (
                OwnedFd::from_raw_fd(report_fds[0]),
                OwnedFd::from_raw_fd(report_fds[1]),
            )
        };

        let steps = fdplan::rewrite_plan(&self.extra_fds, report_tx.as_raw_fd(), program_fd);

        let foreground_fd = match self.foreground {
            None => None,
            Some(Foreground::Stdin) => Some(stdio_source_fd(&self.stdin, 0)?),
            Some(Foreground::Stdout) => Some(stdio_source_fd(&self.stdout, 1)?),
            Some(Foreground::Stderr) => Some(stdio_source_fd(&self.stderr, 2)?),
            Some(Foreground::Fd(fd)) => Some(fd),
        };

        let spec = ChildSpec {
            argv: argv.as_ptr(),
            envp: envp.as_ptr(),
            program: program_path
                .as_ref()
                .map(|p| p.as_ptr())
                .unwrap_or(std::ptr::null()),
            use_path,
            has_program_fd: program_fd.is_some(),
            report: report_tx.as_raw_fd(),
            steps: &steps,
            stdin: stdio_plan(&self.stdin, 0),
            stdout: stdio_plan(&self.stdout, 1),
            stderr: stdio_plan(&self.stderr, 2),
            scheduler_policy: self.scheduler_policy.map(|p| {
                let mut raw = p.raw();
                if self.scheduler_reset_on_fork {
                    raw |= libc::SCHED_RESET_ON_FORK;
                }
                raw
            }),
            scheduler_priority: self.scheduler_priority,
            start_new_session: self.start_new_session,
            process_group: self.process_group,
            extra_groups: self.extra_groups.as_deref(),
            rgid: self.rgid,
            egid: self.egid,
            ruid: self.ruid,
            euid: self.euid,
            umask: self.umask,
            pdeathsig: self.pdeathsig,
            working_directory: self
                .working_directory
                .as_ref()
                .map(|p| p.as_ptr())
                .unwrap_or(std::ptr::null()),
            working_directory_fd: self.working_directory_fd,
            set_ctty: self.set_ctty,
            foreground: foreground_fd,
            capabilities: self.capabilities,
            nsenter: [
                (self.nsenter_user, libc::CLONE_NEWUSER),
                (self.nsenter_mount, libc::CLONE_NEWNS),
                (self.nsenter_uts, libc::CLONE_NEWUTS),
                (self.nsenter_ipc, libc::CLONE_NEWIPC),
                (self.nsenter_net, libc::CLONE_NEWNET),
            ],
        };

        let pid = unsafe { libc::fork() };
        if pid == -1 {
            return Err(Error::last_os_error());
        }
        if pid == 0 {
            let code = unsafe { child_main(&spec) };
            unsafe { libc::_exit(code) };
        }

        drop(report_tx);

        // The child is unreaped, so its pid cannot be recycled yet and
        // taking the pidfd here is race-free.
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if pidfd == -1 {
            let err = Error::last_os_error();
            unsafe {
                libc::kill(pid, libc::SIGKILL);
                reap(pid);
            }
            return Err(err);
        }
        let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as RawFd) };

        // EOF means exec happened; a payload carries the failing step's
        // errno.
        let mut reply = [0u8; 4];
        let n = loop {
            let n = unsafe {
                libc::read(report_rx.as_raw_fd(), reply.as_mut_ptr().cast(), reply.len())
            };
            if n == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break n;
        };
        if n == -1 {
            return Err(Error::last_os_error());
        }
        if n != 0 {
            let code = i32::from_ne_bytes(reply);
            unsafe { reap(pid) };
            return Err(Error::errno(code));
        }

        let shared = Rc::new(ChildShared {
            pidfd,
            pid,
            kill_signal: self.kill_on_drop,
            status: Cell::new(None),
            wait_in_progress: Cell::new(false),
            reaped: Cell::new(false),
            vm: Rc::downgrade(&vm),
            pending_id: Cell::new(0),
        });
        let id = vm.register_pending(shared.clone());
        shared.pending_id.set(id);
        Ok(Child { shared })
    }
}

fn stdio_plan(stdio: &Stdio, slot: RawFd) -> StdioPlan {
    match stdio {
        Stdio::Inherit => StdioPlan::Inherit,
        Stdio::Null => StdioPlan::Null,
        Stdio::Fd(fd) if *fd == slot => StdioPlan::Inherit,
        Stdio::Fd(fd) => StdioPlan::Dup(*fd),
    }
}

fn stdio_source_fd(stdio: &Stdio, slot: RawFd) -> Result<RawFd> {
    match stdio {
        Stdio::Inherit => Ok(slot),
        Stdio::Fd(fd) => Ok(*fd),
        Stdio::Null => Err(Error::invalid_argument("foreground")),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Child side
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy)]
enum StdioPlan {
    Inherit,
    Dup(RawFd),
    Null,
}

struct ChildSpec<'a> {
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    program: *const libc::c_char,
    use_path: bool,
    has_program_fd: bool,
    report: RawFd,
    steps: &'a [Step],
    stdin: StdioPlan,
    stdout: StdioPlan,
    stderr: StdioPlan,
    scheduler_policy: Option<libc::c_int>,
    scheduler_priority: Option<libc::c_int>,
    start_new_session: bool,
    process_group: Option<libc::pid_t>,
    extra_groups: Option<&'a [libc::gid_t]>,
    rgid: Option<libc::gid_t>,
    egid: Option<libc::gid_t>,
    ruid: Option<libc::uid_t>,
    euid: Option<libc::uid_t>,
    umask: Option<libc::mode_t>,
    pdeathsig: Option<libc::c_int>,
    working_directory: *const libc::c_char,
    working_directory_fd: Option<RawFd>,
    set_ctty: Option<RawFd>,
    foreground: Option<RawFd>,
    capabilities: Option<crate::system::Capabilities>,
    nsenter: [(Option<RawFd>, libc::c_int); 5],
}

/// Reports `errno` through the pipe and returns the child's exit code.
unsafe fn child_fail(report: RawFd) -> i32 {
    let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    let bytes = code.to_ne_bytes();
    libc::write(report, bytes.as_ptr().cast(), bytes.len());
    1
}

/// The pre-exec sequencer. Runs between fork and exec: syscalls only, no
/// allocation, no locks.
unsafe fn child_main(spec: &ChildSpec<'_>) -> i32 {
    let mut report = spec.report;

    // 1. Every signal disposition back to default.
    {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        for signo in 1..=SIGNAL_MAX {
            libc::sigaction(signo, &sa, std::ptr::null_mut());
        }
    }

    // 2. Scheduler class.
    if let Some(policy) = spec.scheduler_policy {
        let sp = libc::sched_param {
            sched_priority: spec.scheduler_priority.unwrap_or(0),
        };
        if libc::sched_setscheduler(0, policy, &sp) == -1 {
            return child_fail(report);
        }
    } else if let Some(priority) = spec.scheduler_priority {
        let sp = libc::sched_param {
            sched_priority: priority,
        };
        if libc::sched_setparam(0, &sp) == -1 {
            return child_fail(report);
        }
    }

    // 3. Session, then process group.
    if spec.start_new_session && libc::setsid() == -1 {
        return child_fail(report);
    }
    if let Some(pgid) = spec.process_group {
        if libc::setpgid(0, pgid) == -1 {
            return child_fail(report);
        }
    }

    // 4. Supplementary groups first, then gids, then uids: the gid drop
    // must happen while we still own the privilege to perform it.
    if let Some(groups) = spec.extra_groups {
        if libc::setgroups(groups.len(), groups.as_ptr()) == -1 {
            return child_fail(report);
        }
    }
    if spec.rgid.is_some() || spec.egid.is_some() {
        let rgid = spec.rgid.unwrap_or(!0);
        let egid = match spec.egid {
            Some(egid) => egid,
            None => {
                let mut r = 0;
                let mut e = 0;
                let mut s = 0;
                libc::getresgid(&mut r, &mut e, &mut s);
                e
            }
        };
        if libc::setresgid(rgid, egid, egid) == -1 {
            return child_fail(report);
        }
    }
    if spec.ruid.is_some() || spec.euid.is_some() {
        let ruid = spec.ruid.unwrap_or(!0);
        let euid = match spec.euid {
            Some(euid) => euid,
            None => {
                let mut r = 0;
                let mut e = 0;
                let mut s = 0;
                libc::getresuid(&mut r, &mut e, &mut s);
                e
            }
        };
        if libc::setresuid(ruid, euid, euid) == -1 {
            return child_fail(report);
        }
    }
    if let Some(caps) = &spec.capabilities {
        if caps.raw_apply() == -1 {
            return child_fail(report);
        }
    }

    // 5. umask and parent-death signal.
    if let Some(mask) = spec.umask {
        libc::umask(mask);
    }
    if let Some(signal) = spec.pdeathsig {
        if libc::prctl(libc::PR_SET_PDEATHSIG, signal) == -1 {
            return child_fail(report);
        }
    }

    // 6. Working directory: path form first, then the fd form.
    if !spec.working_directory.is_null() && libc::chdir(spec.working_directory) == -1 {
        return child_fail(report);
    }
    if let Some(fd) = spec.working_directory_fd {
        if libc::fchdir(fd) == -1 {
            return child_fail(report);
        }
    }

    // 7. Terminal control.
    if let Some(fd) = spec.set_ctty {
        if libc::ioctl(fd, libc::TIOCSCTTY, 0) == -1 {
            return child_fail(report);
        }
    } else if let Some(fd) = spec.foreground {
        let pgrp = match spec.process_group {
            Some(0) | None => libc::getpgrp(),
            Some(pgid) => pgid,
        };
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTTOU);
        libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if libc::tcsetpgrp(fd, pgrp) == -1 {
            return child_fail(report);
        }
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }

    // 8. Namespace entry.
    for (fd, flag) in spec.nsenter.iter() {
        if let Some(fd) = fd {
            if libc::setns(*fd, *flag) == -1 {
                return child_fail(report);
            }
        }
    }

    // 9. Standard streams, then the fd-table rewrite.
    for (plan, slot) in [
        (spec.stdin, 0 as RawFd),
        (spec.stdout, 1),
        (spec.stderr, 2),
    ] {
        match plan {
            StdioPlan::Inherit => {}
            StdioPlan::Dup(src) => {
                if libc::dup2(src, slot) == -1 {
                    return child_fail(report);
                }
            }
            StdioPlan::Null => {
                let mut pipefd = [0 as RawFd; 2];
                if libc::pipe(pipefd.as_mut_ptr()) == -1 {
                    return child_fail(report);
                }
                // Reads get EOF, writes get EPIPE once the sibling end
                // dies with close_range/exec.
                let src = if slot == 0 { pipefd[0] } else { pipefd[1] };
                if libc::dup2(src, slot) == -1 {
                    return child_fail(report);
                }
            }
        }
    }

    for step in spec.steps.iter() {
        match *step {
            Step::Dup2 { src, dst } => {
                if libc::dup2(src, dst) == -1 {
                    return child_fail(report);
                }
                if src == report {
                    report = dst;
                }
            }
            Step::Close { fd } => {
                libc::close(fd);
            }
            Step::Cloexec { fd } => {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) == -1 {
                    return child_fail(report);
                }
            }
            Step::CloseRange { first } => {
                if libc::syscall(libc::SYS_close_range, first as libc::c_uint, libc::c_uint::MAX, 0)
                    == -1
                {
                    return child_fail(report);
                }
            }
        }
    }
    // The plan always parks the report pipe on its reserved slot.
    report = REPORT_SLOT;

    if spec.has_program_fd {
        libc::fexecve(PROGRAM_SLOT, spec.argv, spec.envp);
    } else if spec.use_path {
        libc::execvpe(spec.program, spec.argv, spec.envp);
    } else {
        libc::execve(spec.program, spec.argv, spec.envp);
    }
    child_fail(report)
}

unsafe fn reap(pid: libc::pid_t) {
    let mut info: libc::siginfo_t = std::mem::zeroed();
    libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, libc::WEXITED);
}

////////////////////////////////////////////////////////////////////////////////
// Child handle
////////////////////////////////////////////////////////////////////////////////

/// How the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    /// The exit code, or `128 + signo` for signal deaths.
    pub fn exit_code(&self) -> i32 {
        match self.code {
            Some(code) => code,
            None => 128 + self.signal.unwrap_or(0),
        }
    }

    /// The terminating signal, if any.
    pub fn exit_signal(&self) -> Option<i32> {
        self.signal
    }
}

#[derive(Debug)]
struct ChildShared {
    pidfd: OwnedFd,
    pid: libc::pid_t,
    kill_signal: libc::c_int,
    status: Cell<Option<ExitStatus>>,
    wait_in_progress: Cell<bool>,
    reaped: Cell<bool>,
    vm: Weak<VmContext>,
    pending_id: Cell<u64>,
}

impl ChildShared {
    fn send_signal(&self, signal: libc::c_int) -> Result<()> {
        let res = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                signal,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        if res == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn reap_now(&self) -> ExitStatus {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::waitid(
                libc::P_PID,
                self.pid as libc::id_t,
                &mut info,
                libc::WEXITED,
            )
        };
        self.reaped.set(true);
        let status = unsafe { info.si_status() };
        let status = if info.si_code == libc::CLD_EXITED {
            ExitStatus {
                code: Some(status),
                signal: None,
            }
        } else {
            ExitStatus {
                code: None,
                signal: Some(status),
            }
        };
        self.status.set(Some(status));
        status
    }
}

impl PendingOperation for ChildShared {
    fn cancel(&self) {
        if !self.reaped.get() {
            let _ = self.send_signal(libc::SIGKILL);
        }
    }
}

/// A spawned subprocess.
#[derive(Debug)]
pub struct Child {
    shared: Rc<ChildShared>,
}

impl Child {
    pub fn pid(&self) -> libc::pid_t {
        self.shared.pid
    }

    /// Sends a signal through the process descriptor.
    pub fn kill(&self, signal: libc::c_int) -> Result<()> {
        self.shared.send_signal(signal)
    }

    /// The cached exit status, once a `wait` completed.
    pub fn status(&self) -> Option<ExitStatus> {
        self.shared.status.get()
    }

    /// The capability sets of the (still running) child.
    pub fn capabilities(&self) -> Result<crate::system::Capabilities> {
        crate::system::Capabilities::of_process(self.shared.pid)
    }

    /// Waits for the child to exit.
    ///
    /// At most one wait may be in flight; interruption cancels the
    /// readiness wait and resumes with `interrupted` without reaping.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let vm = current_vm();
        vm.check_suspend()?;

        if let Some(status) = self.shared.status.get() {
            return Ok(status);
        }
        if self.shared.wait_in_progress.get() {
            return Err(Error::errno(libc::EBUSY));
        }

        self.shared.wait_in_progress.set(true);
        let ready = stream::fd_readable(self.shared.pidfd.as_raw_fd()).await;
        self.shared.wait_in_progress.set(false);
        ready?;

        let status = self.shared.reap_now();
        if let Some(vm) = self.shared.vm.upgrade() {
            vm.deregister_pending(self.shared.pending_id.get());
        }
        Ok(status)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Some(vm) = self.shared.vm.upgrade() {
            vm.deregister_pending(self.shared.pending_id.get());
        }
        if self.shared.reaped.get() {
            return;
        }
        let _ = self.shared.send_signal(self.shared.kill_signal);
        // Reap asynchronously so no zombie outlives us; without a live
        // reactor the process is exiting anyway.
        let shared = self.shared.clone();
        Reactor::with_current(move |r| {
            let fd = shared.pidfd.as_raw_fd();
            r.add_watch(fd, crate::reactor::Interest::READABLE, move |_| {
                shared.reap_now();
            });
        });
    }
}

//! Non-cooperative spawner: the target is created suspended, parked at its
//! entry point with a two-byte trap, and made to call its own library
//! loader on an injected payload before a single instruction of its own
//! code runs.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::iter::{once, repeat_n};
use std::mem::{size_of, zeroed};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{
    AsHandle, AsRawHandle, BorrowedHandle, FromRawHandle, OwnedHandle,
};
use std::ptr::{null, null_mut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use tokio::time::{Instant, sleep};
use winapi::shared::basetsd::SIZE_T;
use winapi::shared::minwindef::{DWORD, TRUE};
use winapi::um::handleapi::{INVALID_HANDLE_VALUE, SetHandleInformation};
use winapi::um::memoryapi::{ReadProcessMemory, VirtualAllocEx, WriteProcessMemory};
use winapi::um::processthreadsapi::{
    CreateProcessW, FlushInstructionCache, GetExitCodeProcess, GetThreadContext,
    PROCESS_INFORMATION, ResumeThread, STARTUPINFOW, SetThreadContext, SuspendThread,
    TerminateProcess,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, TH32CS_SNAPMODULE,
};
use winapi::um::winbase::{
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, HANDLE_FLAG_INHERIT, INFINITE,
    STARTF_USESTDHANDLES, WAIT_OBJECT_0,
};
use winapi::um::winnt::{CONTEXT, CONTEXT_FULL, MEM_COMMIT, PAGE_EXECUTE_READWRITE};

use crate::command::FuzzCommand;
use crate::error::{InjectError, LaunchError};
use crate::inject::exports::{self, ProcessMemory};
use crate::inject::{ENTRY_POLL_INTERVAL, ENTRY_TRAP, payload};
use crate::{Channels, FuzzedChild, env};

pub type ChannelReader = NamedPipeServer;

/// The payload resolves this name through the target's own loader search
/// path, so the library ships next to the target or in a system directory.
const LIBRARY_FILE: &str = "garble.dll";

/// Module and export the payload calls to pull the library in. Present in
/// every process by the time the loader hands control to the entry point.
const LOADER_MODULE: &str = "kernel32.dll";
const LOADER_SYMBOL: &str = "LoadLibraryA";

/// Exit information for a fuzzed target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(DWORD);

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.0 == 0
    }

    pub fn code(&self) -> u32 {
        self.0
    }
}

pub(crate) struct ChildHandle {
    process: OwnedHandle,
}

impl ChildHandle {
    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        let process = self.process.try_clone()?;
        tokio::task::spawn_blocking(move || {
            let raw = process.as_raw_handle().cast();
            if unsafe { WaitForSingleObject(raw, INFINITE) } != WAIT_OBJECT_0 {
                return Err(io::Error::last_os_error());
            }
            let mut code: DWORD = 0;
            if unsafe { GetExitCodeProcess(raw, &mut code) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(ExitStatus(code))
        })
        .await
        .map_err(io::Error::other)?
    }

    pub(crate) async fn kill(&mut self) -> io::Result<()> {
        if unsafe { TerminateProcess(self.process.as_raw_handle().cast(), 1) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

struct Channel {
    read: NamedPipeServer,
    write: OwnedHandle,
}

/// One anonymous-by-convention named pipe pair. The name is derived from
/// our pid and a counter, used once to bind the two ends, then forgotten.
async fn create_channel() -> io::Result<Channel> {
    let name = format!(
        r"\\.\pipe\garble.{:08x}.{}",
        std::process::id(),
        PIPE_SERIAL.fetch_add(1, Ordering::Relaxed),
    );
    let read = ServerOptions::new()
        .access_inbound(true)
        .access_outbound(false)
        .first_pipe_instance(true)
        .create(&name)?;
    let connect = read.connect();
    let write = std::fs::OpenOptions::new().write(true).open(&name)?;
    connect.await?;

    // Only this write end may cross into the target.
    let write = OwnedHandle::from(write);
    let ok = unsafe {
        SetHandleInformation(
            write.as_raw_handle().cast(),
            HANDLE_FLAG_INHERIT,
            HANDLE_FLAG_INHERIT,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Channel { read, write })
}

fn wide_nul(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(once(0)).collect()
}

/// Quote one argument the way `CommandLineToArgvW` unquotes it.
fn append_quoted(line: &mut Vec<u16>, arg: &OsStr) -> io::Result<()> {
    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    let wide: Vec<u16> = arg.encode_wide().collect();
    if wide.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "argument contains an interior NUL",
        ));
    }
    let needs_quotes =
        wide.is_empty() || wide.iter().any(|&c| c == u16::from(b' ') || c == u16::from(b'\t'));
    if needs_quotes {
        line.push(QUOTE);
    }
    let mut backslashes = 0usize;
    for &c in &wide {
        if c == BACKSLASH {
            backslashes += 1;
        } else {
            if c == QUOTE {
                // n backslashes then a quote must become 2n+1 backslashes
                // then the quote
                line.extend(repeat_n(BACKSLASH, backslashes + 1));
            }
            backslashes = 0;
        }
        line.push(c);
    }
    if needs_quotes {
        // double a trailing backslash run so it cannot escape our quote
        line.extend(repeat_n(BACKSLASH, backslashes));
        line.push(QUOTE);
    }
    Ok(())
}

fn build_command_line(command: &FuzzCommand) -> io::Result<Vec<u16>> {
    let mut line = Vec::new();
    append_quoted(&mut line, &command.program)?;
    for arg in &command.args {
        line.push(u16::from(b' '));
        append_quoted(&mut line, arg)?;
    }
    line.push(0);
    Ok(line)
}

/// Sorted, doubly NUL-terminated unicode environment block.
fn environment_block(envs: &HashMap<OsString, OsString>) -> Vec<u16> {
    let mut entries: Vec<(&OsString, &OsString)> = envs.iter().collect();
    entries.sort_by_key(|(name, _)| name.to_ascii_uppercase());
    let mut block = Vec::new();
    for (name, value) in entries {
        block.extend(name.encode_wide());
        block.push(u16::from(b'='));
        block.extend(value.encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

struct SuspendedProcess {
    process: OwnedHandle,
    thread: OwnedHandle,
    pid: u32,
}

impl SuspendedProcess {
    fn process(&self) -> BorrowedHandle<'_> {
        self.process.as_handle()
    }

    fn thread(&self) -> BorrowedHandle<'_> {
        self.thread.as_handle()
    }

    /// A target that cannot be fully injected must not be left suspended
    /// in the session.
    fn terminate(&self) {
        if unsafe { TerminateProcess(self.process.as_raw_handle().cast(), 1) } == 0 {
            warn!(
                "cannot terminate half-launched target {}: {}",
                self.pid,
                io::Error::last_os_error(),
            );
        }
    }
}

fn create_suspended(
    command: &FuzzCommand,
    stdout_write: &OwnedHandle,
    stderr_write: &OwnedHandle,
) -> io::Result<SuspendedProcess> {
    let program = wide_nul(&command.program);
    let mut command_line = build_command_line(command)?;
    let mut environment = environment_block(&command.envs);
    let cwd = command.cwd.as_ref().map(|dir| wide_nul(dir.as_os_str()));

    let mut startup: STARTUPINFOW = unsafe { zeroed() };
    startup.cb = size_of::<STARTUPINFOW>() as DWORD;
    startup.dwFlags = STARTF_USESTDHANDLES;
    // The target gets no interactive stdin; its output and debug streams
    // are the channel write ends.
    startup.hStdInput = INVALID_HANDLE_VALUE;
    startup.hStdOutput = stdout_write.as_raw_handle().cast();
    startup.hStdError = stderr_write.as_raw_handle().cast();

    let mut info: PROCESS_INFORMATION = unsafe { zeroed() };
    let ok = unsafe {
        CreateProcessW(
            program.as_ptr(),
            command_line.as_mut_ptr(),
            null_mut(),
            null_mut(),
            TRUE,
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            environment.as_mut_ptr().cast(),
            cwd.as_ref().map_or(null(), |dir| dir.as_ptr()),
            &mut startup,
            &mut info,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SuspendedProcess {
        process: unsafe { OwnedHandle::from_raw_handle(info.hProcess.cast()) },
        thread: unsafe { OwnedHandle::from_raw_handle(info.hThread.cast()) },
        pid: info.dwProcessId,
    })
}

fn os_error(step: &'static str) -> InjectError {
    InjectError::Os {
        step,
        source: io::Error::last_os_error(),
    }
}

/// `GetThreadContext` rejects buffers that are not 16-byte aligned.
#[repr(align(16))]
struct AlignedContext(CONTEXT);

impl AlignedContext {
    fn zeroed() -> Self {
        AlignedContext(unsafe { zeroed() })
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// At process birth the loader stub holds the image entry point in
        /// rcx, not in the instruction pointer.
        fn entry_register(context: &CONTEXT) -> u64 {
            context.Rcx
        }
        fn instruction_pointer(context: &CONTEXT) -> u64 {
            context.Rip
        }
        fn set_instruction_pointer(context: &mut CONTEXT, value: u64) {
            context.Rip = value;
        }
        fn stack_pointer(context: &CONTEXT) -> u64 {
            context.Rsp
        }
        fn set_stack_pointer(context: &mut CONTEXT, value: u64) {
            context.Rsp = value;
        }
    } else if #[cfg(target_arch = "x86")] {
        /// At process birth the loader stub holds the image entry point in
        /// eax, not in the instruction pointer.
        fn entry_register(context: &CONTEXT) -> u64 {
            u64::from(context.Eax)
        }
        fn instruction_pointer(context: &CONTEXT) -> u64 {
            u64::from(context.Eip)
        }
        fn set_instruction_pointer(context: &mut CONTEXT, value: u64) {
            context.Eip = value as u32;
        }
        fn stack_pointer(context: &CONTEXT) -> u64 {
            u64::from(context.Esp)
        }
        fn set_stack_pointer(context: &mut CONTEXT, value: u64) {
            context.Esp = value as u32;
        }
    }
}

fn get_thread_context(thread: BorrowedHandle<'_>, context: &mut AlignedContext) -> Result<(), InjectError> {
    context.0.ContextFlags = CONTEXT_FULL;
    if unsafe { GetThreadContext(thread.as_raw_handle().cast(), &mut context.0) } == 0 {
        return Err(os_error("GetThreadContext"));
    }
    Ok(())
}

fn set_thread_context(thread: BorrowedHandle<'_>, context: &AlignedContext) -> Result<(), InjectError> {
    if unsafe { SetThreadContext(thread.as_raw_handle().cast(), &context.0) } == 0 {
        return Err(os_error("SetThreadContext"));
    }
    Ok(())
}

fn resume_thread(thread: BorrowedHandle<'_>) -> Result<(), InjectError> {
    if unsafe { ResumeThread(thread.as_raw_handle().cast()) } == DWORD::MAX {
        return Err(os_error("ResumeThread"));
    }
    Ok(())
}

fn suspend_thread(thread: BorrowedHandle<'_>) -> Result<(), InjectError> {
    if unsafe { SuspendThread(thread.as_raw_handle().cast()) } == DWORD::MAX {
        return Err(os_error("SuspendThread"));
    }
    Ok(())
}

fn flush_instruction_cache(
    process: BorrowedHandle<'_>,
    addr: u64,
    len: usize,
) -> Result<(), InjectError> {
    let ok = unsafe {
        FlushInstructionCache(
            process.as_raw_handle().cast(),
            addr as usize as *const _,
            len as SIZE_T,
        )
    };
    if ok == 0 {
        return Err(os_error("FlushInstructionCache"));
    }
    Ok(())
}

fn allocate_remote(process: BorrowedHandle<'_>, len: usize) -> Result<u64, InjectError> {
    // Never released by us: the payload and path must stay mapped for the
    // target's whole lifetime.
    let addr = unsafe {
        VirtualAllocEx(
            process.as_raw_handle().cast(),
            null_mut(),
            len as SIZE_T,
            MEM_COMMIT,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if addr.is_null() {
        return Err(os_error("VirtualAllocEx"));
    }
    Ok(addr as usize as u64)
}

/// Bounded reads and writes against the target's address space.
struct TargetMemory<'a> {
    process: BorrowedHandle<'a>,
}

impl TargetMemory<'_> {
    fn write_all_at(&self, addr: u64, bytes: &[u8]) -> Result<(), InjectError> {
        let mut transferred: SIZE_T = 0;
        let ok = unsafe {
            WriteProcessMemory(
                self.process.as_raw_handle().cast(),
                addr as usize as *mut _,
                bytes.as_ptr().cast(),
                bytes.len() as SIZE_T,
                &mut transferred,
            )
        };
        if ok == 0 {
            return Err(os_error("WriteProcessMemory"));
        }
        if transferred != bytes.len() {
            return Err(InjectError::ShortWrite {
                addr,
                want: bytes.len(),
                got: transferred,
            });
        }
        Ok(())
    }
}

impl ProcessMemory for TargetMemory<'_> {
    fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> Result<(), InjectError> {
        let mut transferred: SIZE_T = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.process.as_raw_handle().cast(),
                addr as usize as *const _,
                buf.as_mut_ptr().cast(),
                buf.len() as SIZE_T,
                &mut transferred,
            )
        };
        if ok == 0 {
            return Err(os_error("ReadProcessMemory"));
        }
        if transferred != buf.len() {
            return Err(InjectError::ShortRead {
                addr,
                want: buf.len(),
                got: transferred,
            });
        }
        Ok(())
    }
}

fn wide_eq_ignore_ascii_case(wide: &[u16], name: &str) -> bool {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    let wide = &wide[..len];
    wide.len() == name.len()
        && wide
            .iter()
            .zip(name.bytes())
            .all(|(&w, b)| w < 128 && (w as u8).eq_ignore_ascii_case(&b))
}

/// Base address of the loader module inside process `pid`.
fn loader_module_base(pid: u32) -> Result<u64, InjectError> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE, pid) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(os_error("CreateToolhelp32Snapshot"));
    }
    let snapshot = unsafe { OwnedHandle::from_raw_handle(snapshot.cast()) };

    let mut entry: MODULEENTRY32W = unsafe { zeroed() };
    entry.dwSize = size_of::<MODULEENTRY32W>() as DWORD;
    let mut ok = unsafe { Module32FirstW(snapshot.as_raw_handle().cast(), &mut entry) };
    while ok != 0 {
        if wide_eq_ignore_ascii_case(&entry.szModule, LOADER_MODULE) {
            return Ok(entry.modBaseAddr as usize as u64);
        }
        ok = unsafe { Module32NextW(snapshot.as_raw_handle().cast(), &mut entry) };
    }
    Err(InjectError::SymbolNotFound {
        module: LOADER_MODULE.to_owned(),
        symbol: LOADER_SYMBOL.to_owned(),
    })
}

/// Drive the suspended target through the injection protocol and leave it
/// running its loader payload. On any error the target is still alive in
/// an undefined state; the caller terminates it.
async fn inject_library(
    target: &SuspendedProcess,
    library: &str,
    entry_wait: Duration,
) -> Result<(), InjectError> {
    let memory = TargetMemory {
        process: target.process(),
    };
    let mut context = AlignedContext::zeroed();
    get_thread_context(target.thread(), &mut context)?;
    let entry_point = entry_register(&context.0);

    // Park the target: save the first two entry bytes, replace them with
    // the trap, and let the loader run up to it.
    let mut saved = [0u8; ENTRY_TRAP.len()];
    memory.read_exact_at(entry_point, &mut saved)?;
    memory.write_all_at(entry_point, &ENTRY_TRAP)?;
    flush_instruction_cache(target.process(), entry_point, ENTRY_TRAP.len())?;
    resume_thread(target.thread())?;

    let deadline = Instant::now() + entry_wait;
    loop {
        get_thread_context(target.thread(), &mut context)?;
        if instruction_pointer(&context.0) == entry_point {
            break;
        }
        if Instant::now() >= deadline {
            return Err(InjectError::EntryPointTimeout(entry_wait));
        }
        sleep(ENTRY_POLL_INTERVAL).await;
    }
    suspend_thread(target.thread())?;
    get_thread_context(target.thread(), &mut context)?;
    debug!("target {} parked at entry point {entry_point:#x}", target.pid);

    let module_base = loader_module_base(target.pid)?;
    let loader = exports::find_export(&memory, LOADER_MODULE, module_base, LOADER_SYMBOL)?;
    debug!("resolved {LOADER_MODULE}!{LOADER_SYMBOL} at {loader:#x} in target");

    let staged = payload::build(payload::NATIVE, loader, library);
    let remote = allocate_remote(target.process(), staged.len())?;
    memory.write_all_at(remote, &staged)?;

    // The payload ends in `ret`; push the real entry point where that ret
    // will find it, then point the thread at the payload.
    let pointer_len = payload::NATIVE.pointer_len;
    let stack = stack_pointer(&context.0) - pointer_len as u64;
    memory.write_all_at(stack, &entry_point.to_le_bytes()[..pointer_len])?;
    set_stack_pointer(&mut context.0, stack);
    set_instruction_pointer(&mut context.0, remote);
    set_thread_context(target.thread(), &context)?;

    // Unpark: restore the entry bytes and drop every stale icache line.
    memory.write_all_at(entry_point, &saved)?;
    flush_instruction_cache(target.process(), remote, staged.len())?;
    flush_instruction_cache(target.process(), entry_point, saved.len())?;
    resume_thread(target.thread())?;
    debug!("target {} runs the loader payload at {remote:#x}", target.pid);
    Ok(())
}

pub(crate) async fn spawn_impl(mut command: FuzzCommand) -> Result<FuzzedChild, LaunchError> {
    let options = command.options.clone();

    let debug = create_channel().await.map_err(LaunchError::Channel)?;
    let stderr = create_channel().await.map_err(LaunchError::Channel)?;
    let stdout = create_channel().await.map_err(LaunchError::Channel)?;

    command.resolve_program().map_err(LaunchError::Spawn)?;

    // The handle value is stable across inheritance, so the value we hold
    // is the value the target sees.
    let debug_endpoint = debug.write.as_raw_handle() as u64;
    for (name, value) in env::fuzzing_vars(&options, debug_endpoint) {
        command.envs.insert(name.into(), value.into());
    }

    let command_line = command.command_line();
    let target = create_suspended(&command, &stdout.write, &stderr.write)
        .map_err(LaunchError::Spawn)?;

    if let Err(err) = inject_library(&target, LIBRARY_FILE, options.entry_wait).await {
        target.terminate();
        return Err(LaunchError::Inject(err));
    }

    // Parent copies of the write ends drop here; the target keeps its
    // inherited ones until it exits.
    drop(debug.write);
    drop(stderr.write);
    drop(stdout.write);

    Ok(FuzzedChild {
        id: target.pid,
        command_line,
        channels: Channels {
            debug: debug.read,
            stderr: stderr.read,
            stdout: stdout.read,
        },
        handle: ChildHandle {
            process: target.process,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quoted(arg: &str) -> String {
        let mut line = Vec::new();
        append_quoted(&mut line, OsStr::new(arg)).unwrap();
        String::from_utf16(&line).unwrap()
    }

    #[test]
    fn plain_arguments_stay_bare() {
        assert_eq!(quoted("garble.exe"), "garble.exe");
        assert_eq!(quoted(r"C:\tools\target.exe"), r"C:\tools\target.exe");
    }

    #[test]
    fn spaces_and_empties_get_quotes() {
        assert_eq!(quoted("two words"), r#""two words""#);
        assert_eq!(quoted("tab\there"), "\"tab\there\"");
        assert_eq!(quoted(""), r#""""#);
    }

    #[test]
    fn embedded_quotes_and_backslashes_escape() {
        assert_eq!(quoted(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quoted(r#"back\\"slash"#), r#"back\\\\\"slash"#);
        // a trailing backslash run doubles only under quotes
        assert_eq!(quoted(r"dir\"), r"dir\");
        assert_eq!(quoted(r"spaced dir\"), r#""spaced dir\\""#);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut line = Vec::new();
        let arg = OsString::from("a\0b");
        assert!(append_quoted(&mut line, &arg).is_err());
    }

    #[test]
    fn environment_block_is_sorted_and_terminated() {
        let envs: HashMap<OsString, OsString> = [
            (OsString::from("zebra"), OsString::from("1")),
            (OsString::from("ALPHA"), OsString::from("2")),
            (OsString::from("Mid"), OsString::from("3")),
        ]
        .into_iter()
        .collect();
        let block = environment_block(&envs);
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "ALPHA=2\0Mid=3\0zebra=1\0\0");
    }

    #[test]
    fn empty_environment_block_is_double_nul() {
        assert_eq!(environment_block(&HashMap::new()), vec![0, 0]);
    }

    #[test]
    fn module_names_compare_case_insensitively() {
        let mut wide: Vec<u16> = "KERNEL32.DLL".encode_utf16().collect();
        wide.push(0);
        wide.resize(256, 0);
        assert!(wide_eq_ignore_ascii_case(&wide, "kernel32.dll"));
        assert!(!wide_eq_ignore_ascii_case(&wide, "kernel32"));
        assert!(!wide_eq_ignore_ascii_case(&wide, "user32.dll"));
    }
}

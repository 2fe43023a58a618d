//! Last-resort diagnostics: a logging panic hook everywhere, plus a minidump
//! writer for unhandled SEH exceptions on Windows.

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::error;

static INSTALL: Once = Once::new();

/// Install the panic hook (and the exception filter on Windows) once per
/// process. Dumps land in `dump_dir`, which is created on demand.
pub fn install(dump_dir: &Path) {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            error!(%location, "Panic: {}", panic_message(info.payload()));
            previous(info);
        }));

        #[cfg(target_os = "windows")]
        minidump::install(dump_dir.to_path_buf());
        #[cfg(not(target_os = "windows"))]
        tracing::debug!(dump_dir = %dump_dir.display(), "Crash dumps are only written on Windows");
    });
}

/// `frame_bridge_crash_<unix-seconds>.dmp`
pub fn dump_file_name(unix_seconds: u64) -> String {
    format!("frame_bridge_crash_{unix_seconds}.dmp")
}

pub fn dump_path(dir: &Path, now: SystemTime) -> PathBuf {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(dump_file_name(secs))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string payload>"
    }
}

#[cfg(target_os = "windows")]
mod minidump {
    use std::fs::File;
    use std::os::windows::io::AsRawHandle;
    use std::path::PathBuf;
    use std::time::SystemTime;

    use once_cell::sync::OnceCell;
    use tracing::{error, info, warn};
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Diagnostics::Debug::{
        MiniDumpWithDataSegs, MiniDumpWithHandleData, MiniDumpWithThreadInfo,
        MiniDumpWithUnloadedModules, MiniDumpWriteDump, SetUnhandledExceptionFilter,
        EXCEPTION_POINTERS, MINIDUMP_EXCEPTION_INFORMATION, MINIDUMP_TYPE,
    };
    use windows::Win32::System::Threading::{
        GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId,
    };

    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    static DUMP_DIR: OnceCell<PathBuf> = OnceCell::new();

    pub(super) fn install(dir: PathBuf) {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), "Cannot create crash dump directory: {e}");
        }
        let _ = DUMP_DIR.set(dir);
        // SAFETY: `write_dump` matches the filter signature and only touches
        // process-global state.
        unsafe {
            SetUnhandledExceptionFilter(Some(write_dump));
        }
        info!("Crash dump handler installed");
    }

    unsafe extern "system" fn write_dump(pointers: *const EXCEPTION_POINTERS) -> i32 {
        let Some(dir) = DUMP_DIR.get() else {
            return EXCEPTION_CONTINUE_SEARCH;
        };
        let path = super::dump_path(dir, SystemTime::now());
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), "Cannot create crash dump: {e}");
                return EXCEPTION_CONTINUE_SEARCH;
            }
        };

        let exception = MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: GetCurrentThreadId(),
            ExceptionPointers: pointers as *mut EXCEPTION_POINTERS,
            ClientPointers: false.into(),
        };
        let kind = MINIDUMP_TYPE(
            MiniDumpWithDataSegs.0
                | MiniDumpWithHandleData.0
                | MiniDumpWithThreadInfo.0
                | MiniDumpWithUnloadedModules.0,
        );
        let written = MiniDumpWriteDump(
            GetCurrentProcess(),
            GetCurrentProcessId(),
            HANDLE(file.as_raw_handle()),
            kind,
            Some(&exception as *const _),
            None,
            None,
        );
        match written {
            Ok(()) => error!(path = %path.display(), "Unhandled exception, crash dump written"),
            Err(e) => error!(path = %path.display(), "Unhandled exception, MiniDumpWriteDump failed: {e}"),
        }
        EXCEPTION_CONTINUE_SEARCH
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn dump_names_use_unix_seconds() {
        assert_eq!(dump_file_name(1_700_000_000), "frame_bridge_crash_1700000000.dmp");
        let at = UNIX_EPOCH + Duration::from_secs(42);
        assert_eq!(
            dump_path(Path::new("dumps"), at),
            Path::new("dumps").join("frame_bridge_crash_42.dmp")
        );
    }

    #[test]
    fn panic_payloads_render() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(owned.as_ref()), "boom");
        let fixed: Box<dyn std::any::Any + Send> = Box::new("static boom");
        assert_eq!(panic_message(fixed.as_ref()), "static boom");
        let other: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "<non-string payload>");
    }
}

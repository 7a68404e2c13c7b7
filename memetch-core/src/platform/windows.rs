use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::logger::Logger;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};
use windows_sys::Win32::Foundation::{
    ERROR_SERVICE_ALREADY_RUNNING, ERROR_SERVICE_DOES_NOT_EXIST, HANDLE,
};
use windows_sys::Win32::Security::SC_HANDLE;
use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::FSCTL_SET_SPARSE;
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, ControlService, CreateServiceW, DeleteService, OpenSCManagerW,
    OpenServiceW, QueryServiceStatus, SC_MANAGER_ALL_ACCESS, SERVICE_ALL_ACCESS,
    SERVICE_CONTROL_STOP, SERVICE_DEMAND_START, SERVICE_ERROR_NORMAL, SERVICE_KERNEL_DRIVER,
    SERVICE_STATUS, SERVICE_STOPPED, StartServiceW,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Issues a `DeviceIoControl` on a raw handle.
fn device_io_control(handle: HANDLE, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
    let input_ptr = if input.is_empty() {
        ptr::null()
    } else {
        input.as_ptr().cast()
    };
    let output_ptr = if output.is_empty() {
        ptr::null_mut()
    } else {
        output.as_mut_ptr().cast()
    };

    let mut returned: u32 = 0;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            input_ptr,
            input.len() as u32,
            output_ptr,
            output.len() as u32,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(returned as usize)
}

/// The pmem driver's device object.
///
/// Reads and seeks go through the regular file API, which the driver maps
/// onto physical memory.
pub struct PmemDevice {
    file: Option<File>,
}

impl PmemDevice {
    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device handle closed"))
    }
}

impl Read for PmemDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }
}

impl Seek for PmemDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

impl DeviceHandle for PmemDevice {
    fn control(&mut self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
        let handle = self.file()?.as_raw_handle() as HANDLE;
        device_io_control(handle, code, input, output)
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the file closes the handle.
        self.file.take();
        Ok(())
    }
}

/// Opens the driver's device object for reading and control requests.
pub fn open_device(path: &Path) -> Result<PmemDevice> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .open(path)
        .map_err(|e| Error::Open(Box::new(Error::Io(e))))?;
    Ok(PmemDevice { file: Some(file) })
}

/// Creates or truncates the output file, marking it sparse when requested so
/// skipped gaps do not allocate disk space.
pub fn create_output(path: &Path, sparse: bool) -> Result<File> {
    let file = File::create(path)?;
    if sparse {
        device_io_control(file.as_raw_handle() as HANDLE, FSCTL_SET_SPARSE, &[], &mut [])?;
    }
    Ok(file)
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(once(0)).collect()
}

/// Owned service control manager or service handle.
struct ScHandle(SC_HANDLE);

impl ScHandle {
    fn manager() -> io::Result<Self> {
        let handle = unsafe { OpenSCManagerW(ptr::null(), ptr::null(), SC_MANAGER_ALL_ACCESS) };
        Self::check(handle)
    }

    fn check(handle: SC_HANDLE) -> io::Result<Self> {
        if handle == 0 as SC_HANDLE {
            Err(io::Error::last_os_error())
        } else {
            Ok(ScHandle(handle))
        }
    }

    fn open_service(&self, name: &[u16]) -> io::Result<Self> {
        Self::check(unsafe { OpenServiceW(self.0, name.as_ptr(), SERVICE_ALL_ACCESS) })
    }

    fn status(&self) -> io::Result<SERVICE_STATUS> {
        let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
        if unsafe { QueryServiceStatus(self.0, &mut status) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(status)
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        unsafe {
            CloseServiceHandle(self.0);
        }
    }
}

fn service_error(name: &str, action: &'static str, source: io::Error) -> Error {
    Error::Service {
        name: name.to_string(),
        action,
        source,
    }
}

fn is_os_error(e: &io::Error, code: u32) -> bool {
    e.raw_os_error() == Some(code as i32)
}

/// Sends a stop request and waits, bounded, for the service to stop.
fn stop_service(service: &ScHandle) -> io::Result<()> {
    let mut status: SERVICE_STATUS = unsafe { std::mem::zeroed() };
    if unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut status) } == 0 {
        return Err(io::Error::last_os_error());
    }

    let deadline = Instant::now() + STOP_TIMEOUT;
    while status.dwCurrentState != SERVICE_STOPPED {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "timeout waiting for service to stop",
            ));
        }
        thread::sleep(STOP_POLL_INTERVAL);
        status = service.status()?;
    }
    Ok(())
}

/// Stops and deletes the driver service, if it exists. A failure to stop is
/// logged and does not prevent deletion.
pub fn uninstall_driver(service_name: &str, logger: &dyn Logger) -> Result<()> {
    let name = wide(OsStr::new(service_name));
    let manager = ScHandle::manager().map_err(|e| service_error(service_name, "connect to", e))?;

    let service = match manager.open_service(&name) {
        Ok(service) => service,
        Err(e) if is_os_error(&e, ERROR_SERVICE_DOES_NOT_EXIST) => return Ok(()),
        Err(e) => return Err(service_error(service_name, "open", e)),
    };

    match stop_service(&service) {
        Ok(()) => logger.info(format_args!("Stopped service {service_name}")),
        Err(e) => logger.info(format_args!("Could not stop service {service_name}: {e}")),
    }

    if unsafe { DeleteService(service.0) } == 0 {
        return Err(service_error(service_name, "remove", io::Error::last_os_error()));
    }
    logger.info(format_args!("Removed service {service_name}"));
    Ok(())
}

/// Registers `driver_path` as a demand-start kernel driver service and
/// starts it, replacing any service already registered under the name.
///
/// # Arguments
///
/// * `driver_path` - The driver file the service loads.
/// * `service_name` - Name to register the service under.
/// * `logger` - Receives a line for each lifecycle step.
///
/// # Errors
///
/// This function will return [`Error::Service`] if:
/// - The service control manager cannot be opened.
/// - An existing service of that name cannot be removed.
/// - The service cannot be created or started. A service that is already
///   running is not an error.
pub fn install_driver(driver_path: &Path, service_name: &str, logger: &dyn Logger) -> Result<()> {
    uninstall_driver(service_name, logger)?;

    let name = wide(OsStr::new(service_name));
    let binary = wide(driver_path.as_os_str());
    let manager = ScHandle::manager().map_err(|e| service_error(service_name, "connect to", e))?;

    logger.info(format_args!("Creating service {service_name}"));
    let service = ScHandle::check(unsafe {
        CreateServiceW(
            manager.0,
            name.as_ptr(),
            name.as_ptr(),
            SERVICE_ALL_ACCESS,
            SERVICE_KERNEL_DRIVER,
            SERVICE_DEMAND_START,
            SERVICE_ERROR_NORMAL,
            binary.as_ptr(),
            ptr::null(),
            ptr::null_mut(),
            ptr::null(),
            ptr::null(),
            ptr::null(),
        )
    })
    .map_err(|e| service_error(service_name, "install", e))?;
    logger.info(format_args!("Installed service {service_name}"));

    if unsafe { StartServiceW(service.0, 0, ptr::null()) } == 0 {
        let e = io::Error::last_os_error();
        if !is_os_error(&e, ERROR_SERVICE_ALREADY_RUNNING) {
            return Err(service_error(service_name, "start", e));
        }
    }
    logger.info(format_args!("Started service {service_name}"));
    Ok(())
}

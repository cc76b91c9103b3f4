//! Headless compositor stack
//!
//! In-process stand-in for a full rendering stack: it owns a real Wayland
//! listening socket under `XDG_RUNTIME_DIR` and announces a single virtual
//! output when the backend starts. Protocol dispatch for connected clients
//! is out of scope here; the session only needs the socket to exist and the
//! output chain to behave like the real thing.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;

use log::{debug, info, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use super::{
    AllocatorHandle, BackendHandle, BackendOptions, Compositor, CompositorError, CompositorEvent,
    DisplayHandle, GlobalHandle, GlobalKind, LayoutHandle, LegacyHandle, OutputHandle,
    RendererHandle, Result, SceneHandle, SeatHandle,
};

/// Default mode of the virtual output, matching common headless backends.
const VIRTUAL_OUTPUT_WIDTH: i32 = 1280;
const VIRTUAL_OUTPUT_HEIGHT: i32 = 720;

/// Highest socket index probed under the runtime directory.
const MAX_SOCKET_INDEX: u32 = 32;

struct SocketState {
    name: String,
    path: PathBuf,
    // Held so the socket stays bound for the session lifetime.
    #[allow(dead_code)]
    listener: UnixListener,
}

struct VirtualOutput {
    name: String,
    width: i32,
    height: i32,
    enabled: bool,
    position: (i32, i32),
}

/// Compositor stack without rendering hardware.
pub struct HeadlessCompositor {
    next_id: u32,
    display_alive: bool,
    backend_started: bool,
    socket: Option<SocketState>,
    outputs: HashMap<u32, VirtualOutput>,
    pending: VecDeque<CompositorEvent>,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
}

impl HeadlessCompositor {
    pub fn new() -> io::Result<Self> {
        let (wake_read, wake_write) = wake_pipe()?;
        Ok(HeadlessCompositor {
            next_id: 1,
            display_alive: false,
            backend_started: false,
            socket: None,
            outputs: HashMap::new(),
            pending: VecDeque::new(),
            wake_read,
            wake_write,
        })
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push_event(&mut self, event: CompositorEvent) {
        self.pending.push_back(event);
        // A single byte wakes the poll loop; the queue carries the payload.
        let ret = unsafe { libc::write(self.wake_write.as_raw_fd(), [1u8].as_ptr() as *const _, 1) };
        if ret < 0 {
            warn!(
                "failed to wake the event loop: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Create the nonblocking, close-on-exec wake pipe.
fn wake_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
            .map_err(io::Error::from)?;
    }
    let flags = fcntl(read.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(read.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok((read, write))
}

impl Compositor for HeadlessCompositor {
    fn create_display(&mut self) -> Result<DisplayHandle> {
        self.display_alive = true;
        Ok(DisplayHandle(self.allocate_id()))
    }
    fn destroy_display(&mut self, _display: DisplayHandle) {
        self.display_alive = false;
    }

    fn create_backend(
        &mut self,
        _display: DisplayHandle,
        options: &BackendOptions,
    ) -> Result<BackendHandle> {
        if options.allow_vt_switch {
            debug!("virtual-terminal switching requested; headless backend has no VT");
        }
        Ok(BackendHandle(self.allocate_id()))
    }
    fn destroy_backend(&mut self, _backend: BackendHandle) {
        self.backend_started = false;
        self.outputs.clear();
    }

    fn create_renderer(&mut self, _backend: BackendHandle) -> Result<RendererHandle> {
        Ok(RendererHandle(self.allocate_id()))
    }
    fn destroy_renderer(&mut self, _renderer: RendererHandle) {}

    fn create_allocator(
        &mut self,
        _backend: BackendHandle,
        _renderer: RendererHandle,
    ) -> Result<AllocatorHandle> {
        Ok(AllocatorHandle(self.allocate_id()))
    }
    fn destroy_allocator(&mut self, _allocator: AllocatorHandle) {}

    fn create_output_layout(&mut self) -> Result<LayoutHandle> {
        Ok(LayoutHandle(self.allocate_id()))
    }
    fn destroy_output_layout(&mut self, _layout: LayoutHandle) {}

    fn create_scene(&mut self, _layout: LayoutHandle) -> Result<SceneHandle> {
        Ok(SceneHandle(self.allocate_id()))
    }
    fn destroy_scene(&mut self, _scene: SceneHandle) {}

    fn create_seat(
        &mut self,
        _display: DisplayHandle,
        _backend: BackendHandle,
    ) -> Result<SeatHandle> {
        Ok(SeatHandle(self.allocate_id()))
    }
    fn destroy_seat(&mut self, _seat: SeatHandle) {}

    fn create_global(&mut self, _display: DisplayHandle, kind: GlobalKind) -> Result<GlobalHandle> {
        debug!("advertising {} service", kind.label());
        Ok(GlobalHandle(self.allocate_id()))
    }
    fn destroy_global(&mut self, _global: GlobalHandle) {}

    fn create_legacy_display(
        &mut self,
        _display: DisplayHandle,
    ) -> Result<(LegacyHandle, String)> {
        // No X11 server is bundled with the headless stack.
        Err(CompositorError::Unavailable("legacy display server"))
    }
    fn load_cursor_theme(&mut self, _legacy: LegacyHandle) -> Result<()> {
        Err(CompositorError::Unavailable("cursor theme"))
    }
    fn apply_cursor_image(&mut self, _legacy: LegacyHandle) -> Result<()> {
        Err(CompositorError::Unavailable("cursor image"))
    }
    fn destroy_legacy_display(&mut self, _legacy: LegacyHandle) {}

    fn add_socket(&mut self, _display: DisplayHandle) -> Result<String> {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .ok_or_else(|| CompositorError::Backend("XDG_RUNTIME_DIR is not set".into()))?;
        let runtime_dir = PathBuf::from(runtime_dir);

        for index in 1..=MAX_SOCKET_INDEX {
            let name = format!("wayland-{index}");
            let path = runtime_dir.join(&name);
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    listener.set_nonblocking(true)?;
                    info!("listening on {}", path.display());
                    self.socket = Some(SocketState {
                        name: name.clone(),
                        path,
                        listener,
                    });
                    return Ok(name);
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                    debug!("{} is taken, trying the next name", path.display());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(CompositorError::Backend(format!(
            "no free socket name under {}",
            runtime_dir.display()
        )))
    }
    fn remove_socket(&mut self, _display: DisplayHandle) {
        if let Some(socket) = self.socket.take() {
            if let Err(err) = std::fs::remove_file(&socket.path) {
                warn!("failed to unlink {}: {}", socket.path.display(), err);
            }
        }
    }

    fn start_backend(&mut self, _backend: BackendHandle) -> Result<()> {
        if self.backend_started {
            return Err(CompositorError::Backend("backend already started".into()));
        }
        self.backend_started = true;
        let id = self.allocate_id();
        self.outputs.insert(
            id,
            VirtualOutput {
                name: format!("HEADLESS-{id}"),
                width: VIRTUAL_OUTPUT_WIDTH,
                height: VIRTUAL_OUTPUT_HEIGHT,
                enabled: false,
                position: (0, 0),
            },
        );
        self.push_event(CompositorEvent::OutputAdded(OutputHandle(id)));
        Ok(())
    }
    fn stop_backend(&mut self, _backend: BackendHandle) {
        self.backend_started = false;
    }

    fn output_name(&self, output: OutputHandle) -> String {
        self.outputs
            .get(&output.0)
            .map(|o| o.name.clone())
            .unwrap_or_default()
    }
    fn output_size(&self, output: OutputHandle) -> (i32, i32) {
        self.outputs
            .get(&output.0)
            .map(|o| (o.width, o.height))
            .unwrap_or((0, 0))
    }
    fn enable_output(&mut self, output: OutputHandle, x: i32, y: i32) -> Result<()> {
        let out = self
            .outputs
            .get_mut(&output.0)
            .ok_or(CompositorError::Unavailable("output"))?;
        out.enabled = true;
        out.position = (x, y);
        debug!("output {} enabled at {},{}", out.name, x, y);
        Ok(())
    }
    fn disable_output(&mut self, output: OutputHandle) -> Result<()> {
        let out = self
            .outputs
            .get_mut(&output.0)
            .ok_or(CompositorError::Unavailable("output"))?;
        out.enabled = false;
        debug!("output {} disabled", out.name);
        Ok(())
    }

    fn event_fd(&self) -> RawFd {
        self.wake_read.as_raw_fd()
    }
    fn drain_events(&mut self) -> Vec<CompositorEvent> {
        // Drain the wake bytes first so the fd goes quiet.
        let mut buf = [0u8; 64];
        loop {
            let ret = unsafe {
                libc::read(self.wake_read.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
            };
            if ret <= 0 {
                break;
            }
        }
        self.pending.drain(..).collect()
    }

    fn flush_clients(&mut self, _display: DisplayHandle) {
        debug!("disconnecting remaining clients");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_runtime_dir<T>(f: impl FnOnce() -> T) -> T {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_RUNTIME_DIR", dir.path());
        f()
    }

    #[test]
    fn socket_is_created_and_removed() {
        with_runtime_dir(|| {
            let mut comp = HeadlessCompositor::new().unwrap();
            let display = comp.create_display().unwrap();
            let name = comp.add_socket(display).unwrap();
            assert!(name.starts_with("wayland-"));
            let path = PathBuf::from(std::env::var("XDG_RUNTIME_DIR").unwrap()).join(&name);
            assert!(path.exists());
            comp.remove_socket(display);
            assert!(!path.exists());
        });
    }

    #[test]
    fn backend_start_announces_an_output() {
        let mut comp = HeadlessCompositor::new().unwrap();
        let display = comp.create_display().unwrap();
        let backend = comp
            .create_backend(display, &BackendOptions::default())
            .unwrap();
        comp.start_backend(backend).unwrap();
        let events = comp.drain_events();
        assert_eq!(events.len(), 1);
        match events[0] {
            CompositorEvent::OutputAdded(output) => {
                assert_eq!(
                    comp.output_size(output),
                    (VIRTUAL_OUTPUT_WIDTH, VIRTUAL_OUTPUT_HEIGHT)
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

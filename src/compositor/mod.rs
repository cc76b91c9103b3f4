//! Boundary to the compositor library
//!
//! The session core does not implement rendering, input routing or protocol
//! wire encoding; it drives an external compositor stack through the
//! [`Compositor`] trait. Every object the session creates is identified by a
//! small copyable handle so teardown actions can be recorded without
//! borrowing the stack itself.

pub mod headless;

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Error reported by the compositor stack for a single operation.
#[derive(Debug, Error)]
pub enum CompositorError {
    /// The requested object or feature is not provided by this stack.
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
    /// Failure from the underlying system (socket, pipe, device).
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Backend-specific failure with a human-readable reason.
    #[error("{0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, CompositorError>;

macro_rules! handle_types {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub u32);
        )+
    };
}

handle_types! {
    /// The display context owning the protocol object registry.
    DisplayHandle,
    /// The hardware (or virtual) backend producing outputs and input.
    BackendHandle,
    /// The renderer bound to the backend.
    RendererHandle,
    /// The buffer allocator bound to backend and renderer.
    AllocatorHandle,
    /// The output layout the scene is attached to.
    LayoutHandle,
    /// The scene graph.
    SceneHandle,
    /// A protocol service advertised on the display.
    GlobalHandle,
    /// The input seat.
    SeatHandle,
    /// The legacy X11 compatibility display.
    LegacyHandle,
    /// A physical or virtual output managed by the backend.
    OutputHandle,
    /// A client surface handed over by the shell service.
    SurfaceHandle,
}

/// Protocol services created during bootstrap, one global each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    Compositing,
    DataTransfer,
    PrimarySelection,
    IdleNotifier,
    IdleInhibit,
    XdgShell,
    XdgDecoration,
    ServerDecoration { prefer_server_side: bool },
    Presentation,
    ScreenCapture,
    OutputManagement,
    VirtualKeyboard,
    VirtualPointer,
    GammaControl,
    RelativePointer,
}

impl GlobalKind {
    /// Short name used in logs and teardown records.
    pub fn label(&self) -> &'static str {
        match self {
            GlobalKind::Compositing => "compositing",
            GlobalKind::DataTransfer => "data-transfer",
            GlobalKind::PrimarySelection => "primary-selection",
            GlobalKind::IdleNotifier => "idle-notifier",
            GlobalKind::IdleInhibit => "idle-inhibit",
            GlobalKind::XdgShell => "xdg-shell",
            GlobalKind::XdgDecoration => "xdg-decoration",
            GlobalKind::ServerDecoration { .. } => "server-decoration",
            GlobalKind::Presentation => "presentation",
            GlobalKind::ScreenCapture => "screen-capture",
            GlobalKind::OutputManagement => "output-management",
            GlobalKind::VirtualKeyboard => "virtual-keyboard",
            GlobalKind::VirtualPointer => "virtual-pointer",
            GlobalKind::GammaControl => "gamma-control",
            GlobalKind::RelativePointer => "relative-pointer",
        }
    }
}

/// Capability flags passed to the backend at creation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendOptions {
    /// Permit virtual-terminal switching while the session runs.
    pub allow_vt_switch: bool,
}

/// Event delivered by the compositor stack on the session event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorEvent {
    OutputAdded(OutputHandle),
    OutputRemoved(OutputHandle),
    NewSurface(SurfaceHandle),
    SurfaceDestroyed(SurfaceHandle),
}

/// Interface the session core requires from the compositor stack.
///
/// Creation methods come in pairs with a destroy counterpart so the
/// teardown stack can invert each bootstrap step individually. All calls
/// happen on the event-loop thread.
pub trait Compositor {
    fn create_display(&mut self) -> Result<DisplayHandle>;
    fn destroy_display(&mut self, display: DisplayHandle);

    fn create_backend(
        &mut self,
        display: DisplayHandle,
        options: &BackendOptions,
    ) -> Result<BackendHandle>;
    fn destroy_backend(&mut self, backend: BackendHandle);

    fn create_renderer(&mut self, backend: BackendHandle) -> Result<RendererHandle>;
    fn destroy_renderer(&mut self, renderer: RendererHandle);

    fn create_allocator(
        &mut self,
        backend: BackendHandle,
        renderer: RendererHandle,
    ) -> Result<AllocatorHandle>;
    fn destroy_allocator(&mut self, allocator: AllocatorHandle);

    fn create_output_layout(&mut self) -> Result<LayoutHandle>;
    fn destroy_output_layout(&mut self, layout: LayoutHandle);

    /// Create the scene graph and attach it to `layout`.
    fn create_scene(&mut self, layout: LayoutHandle) -> Result<SceneHandle>;
    fn destroy_scene(&mut self, scene: SceneHandle);

    fn create_seat(&mut self, display: DisplayHandle, backend: BackendHandle)
        -> Result<SeatHandle>;
    fn destroy_seat(&mut self, seat: SeatHandle);

    fn create_global(&mut self, display: DisplayHandle, kind: GlobalKind) -> Result<GlobalHandle>;
    fn destroy_global(&mut self, global: GlobalHandle);

    /// Create the legacy X11 compatibility display. Returns its advertised
    /// display name (e.g. `:0`) alongside the handle.
    fn create_legacy_display(&mut self, display: DisplayHandle)
        -> Result<(LegacyHandle, String)>;
    /// Load the cursor theme for the legacy display. Best effort.
    fn load_cursor_theme(&mut self, legacy: LegacyHandle) -> Result<()>;
    /// Apply the default cursor image to the legacy display. Best effort.
    fn apply_cursor_image(&mut self, legacy: LegacyHandle) -> Result<()>;
    fn destroy_legacy_display(&mut self, legacy: LegacyHandle);

    /// Create the listening socket and return its name (e.g. `wayland-1`).
    fn add_socket(&mut self, display: DisplayHandle) -> Result<String>;
    fn remove_socket(&mut self, display: DisplayHandle);

    fn start_backend(&mut self, backend: BackendHandle) -> Result<()>;
    fn stop_backend(&mut self, backend: BackendHandle);

    /// Name the backend assigned to an output (e.g. a connector name).
    fn output_name(&self, output: OutputHandle) -> String;
    /// Current mode size of an output in pixels.
    fn output_size(&self, output: OutputHandle) -> (i32, i32);
    /// Enable an output and place it at `(x, y)` in the layout.
    fn enable_output(&mut self, output: OutputHandle, x: i32, y: i32) -> Result<()>;
    /// Detach an output from the rendered layout.
    fn disable_output(&mut self, output: OutputHandle) -> Result<()>;

    /// Readiness fd signalling queued compositor events.
    fn event_fd(&self) -> RawFd;
    /// Take all queued compositor events.
    fn drain_events(&mut self) -> Vec<CompositorEvent>;

    /// Disconnect all clients ahead of teardown.
    fn flush_clients(&mut self, display: DisplayHandle);
}

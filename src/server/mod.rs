//! Session state and the bootstrap sequencer
//!
//! A [`Server`] is the one session aggregate per process run: it owns the
//! compositor stack, the handles of every subsystem the bootstrap chain
//! created, the teardown stack that can invert them, and the output/view
//! bookkeeping. Bootstrap creates subsystems in a fixed dependency order;
//! any failure stops the chain immediately, unwinds what exists and
//! surfaces the failed step. Only the legacy X11 compatibility layer is
//! best-effort.

mod teardown;

pub use teardown::TeardownStack;

use log::{debug, info, warn};
use thiserror::Error;

use crate::compositor::{
    BackendHandle, BackendOptions, Compositor, CompositorError, CompositorEvent, DisplayHandle,
    GlobalKind, OutputHandle, SurfaceHandle,
};
use crate::event::{EventLoop, Interest, SourceAction};
use crate::output::{extend_positions, OutputId, OutputPolicy, OutputSet};

/// A bootstrap step failed; everything created before it has been undone.
#[derive(Debug, Error)]
#[error("bootstrap step '{step}' failed: {source}")]
pub struct BootstrapError {
    pub step: &'static str,
    #[source]
    pub source: CompositorError,
}

/// Session parameters fixed before bootstrap begins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub output_policy: OutputPolicy,
    /// Prefer server-side window decoration (`-d`).
    pub prefer_server_decorations: bool,
    /// Permit virtual-terminal switching (`-s`).
    pub allow_vt_switch: bool,
}

/// Handles produced by a complete bootstrap chain.
struct Subsystems {
    display: DisplayHandle,
    backend: BackendHandle,
    socket_name: String,
    legacy_display: Option<String>,
}

pub struct Server {
    comp: Box<dyn Compositor>,
    teardown: TeardownStack,
    display: DisplayHandle,
    #[allow(dead_code)]
    backend: BackendHandle,
    outputs: OutputSet,
    views: Vec<SurfaceHandle>,
    policy: OutputPolicy,
    socket_name: String,
    legacy_display: Option<String>,
    /// Set when the loop stopped because the client exited; the client's
    /// own exit code is then propagated as the program's.
    pub return_app_code: bool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("outputs", &self.outputs)
            .field("views", &self.views)
            .field("policy", &self.policy)
            .field("socket_name", &self.socket_name)
            .field("legacy_display", &self.legacy_display)
            .field("return_app_code", &self.return_app_code)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Run the bootstrap chain. On failure the teardown stack is unwound
    /// before the error is returned, so no partially created session is
    /// ever left behind.
    pub fn new(
        mut comp: Box<dyn Compositor>,
        options: &SessionOptions,
    ) -> Result<Server, BootstrapError> {
        let mut teardown = TeardownStack::new();
        match bootstrap(comp.as_mut(), options, &mut teardown) {
            Ok(subsystems) => Ok(Server {
                comp,
                teardown,
                display: subsystems.display,
                backend: subsystems.backend,
                outputs: OutputSet::new(),
                views: Vec::new(),
                policy: options.output_policy,
                socket_name: subsystems.socket_name,
                legacy_display: subsystems.legacy_display,
                return_app_code: false,
            }),
            Err(err) => {
                warn!(
                    "bootstrap failed at step '{}', rolling back {} subsystems",
                    err.step,
                    teardown.len()
                );
                teardown.unwind(comp.as_mut());
                Err(err)
            }
        }
    }

    /// Name of the listening socket, e.g. `wayland-1`.
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// Advertised name of the legacy X11 display, when the layer is up.
    pub fn legacy_display(&self) -> Option<&str> {
        self.legacy_display.as_deref()
    }

    /// Register the compositor's wake fd so queued events are dispatched
    /// from the loop thread.
    pub fn register_event_source(&self, event_loop: &mut EventLoop<Server>) {
        let fd = self.comp.event_fd();
        event_loop.add_fd(
            fd,
            Interest::READABLE,
            Box::new(|server: &mut Server, _readiness, _signal| {
                server.dispatch_compositor_events();
                SourceAction::Keep
            }),
        );
    }

    /// Drain and handle everything the compositor stack queued.
    pub fn dispatch_compositor_events(&mut self) {
        for event in self.comp.drain_events() {
            match event {
                CompositorEvent::OutputAdded(output) => self.handle_output_added(output),
                CompositorEvent::OutputRemoved(output) => self.handle_output_removed(output),
                CompositorEvent::NewSurface(surface) => {
                    debug!("new client surface {:?}", surface);
                    self.views.push(surface);
                }
                CompositorEvent::SurfaceDestroyed(surface) => {
                    self.views.retain(|view| *view != surface);
                }
            }
        }
    }

    fn handle_output_added(&mut self, handle: OutputHandle) {
        let name = self.comp.output_name(handle);
        let (width, height) = self.comp.output_size(handle);
        info!("output {} appeared ({}x{})", name, width, height);
        let id = self.outputs.insert(handle, name, width, height);
        match self.policy {
            OutputPolicy::Extend => self.apply_extend(),
            OutputPolicy::LastOnly => self.activate_only(id),
        }
    }

    fn handle_output_removed(&mut self, handle: OutputHandle) {
        let Some(id) = self.outputs.find(handle) else {
            warn!("unknown output {:?} disappeared", handle);
            return;
        };
        let Some(removed) = self.outputs.remove(id) else {
            return;
        };
        info!("output {} disappeared", removed.name);
        match self.policy {
            OutputPolicy::Extend => self.apply_extend(),
            OutputPolicy::LastOnly => {
                if removed.enabled {
                    if let Some(newest) = self.outputs.newest() {
                        self.activate_only(newest);
                    }
                }
            }
        }
    }

    /// EXTEND: every present output is part of the layout, packed
    /// left-to-right in arrival order.
    fn apply_extend(&mut self) {
        let placements = extend_positions(&self.outputs);
        for (id, x) in placements {
            let Some(entry) = self.outputs.get_mut(id) else {
                continue;
            };
            match self.comp.enable_output(entry.handle, x, 0) {
                Ok(()) => entry.enabled = true,
                Err(err) => warn!("failed to enable output {}: {}", entry.name, err),
            }
        }
    }

    /// LAST-ONLY: the given output becomes the single live one; any other
    /// enabled output is detached from the layout first.
    fn activate_only(&mut self, id: OutputId) {
        let Server { comp, outputs, .. } = self;
        for (other, entry) in outputs.iter_mut() {
            if other != id && entry.enabled {
                match comp.disable_output(entry.handle) {
                    Ok(()) => entry.enabled = false,
                    Err(err) => warn!("failed to disable output {}: {}", entry.name, err),
                }
            }
        }
        if let Some(entry) = outputs.get_mut(id) {
            match comp.enable_output(entry.handle, 0, 0) {
                Ok(()) => entry.enabled = true,
                Err(err) => warn!("failed to enable output {}: {}", entry.name, err),
            }
        }
    }

    /// Disconnect every client from the display. Runs before the blocking
    /// reap of the primary client, so a client that only exits once its
    /// session is gone does not keep the whole host alive.
    pub fn disconnect_clients(&mut self) {
        info!("disconnecting clients");
        self.comp.flush_clients(self.display);
    }

    /// Disconnect clients and unwind every subsystem in reverse creation
    /// order. Consumes the session; the process exits afterwards.
    pub fn shutdown(mut self) {
        info!("shutting down the session");
        self.comp.flush_clients(self.display);
        self.teardown.unwind(self.comp.as_mut());
    }
}

/// Create the subsystem chain in dependency order, pushing one teardown
/// action per successful step. Every step is fail-fast; only the legacy
/// display layer degrades gracefully.
fn bootstrap(
    comp: &mut dyn Compositor,
    options: &SessionOptions,
    teardown: &mut TeardownStack,
) -> Result<Subsystems, BootstrapError> {
    fn fail(step: &'static str) -> impl FnOnce(CompositorError) -> BootstrapError {
        move |source| BootstrapError { step, source }
    }

    let display = comp.create_display().map_err(fail("display"))?;
    teardown.push("display", move |c| c.destroy_display(display));

    let backend_options = BackendOptions {
        allow_vt_switch: options.allow_vt_switch,
    };
    let backend = comp
        .create_backend(display, &backend_options)
        .map_err(fail("backend"))?;
    teardown.push("backend", move |c| c.destroy_backend(backend));

    let renderer = comp.create_renderer(backend).map_err(fail("renderer"))?;
    teardown.push("renderer", move |c| c.destroy_renderer(renderer));

    let allocator = comp
        .create_allocator(backend, renderer)
        .map_err(fail("allocator"))?;
    teardown.push("allocator", move |c| c.destroy_allocator(allocator));

    let layout = comp.create_output_layout().map_err(fail("output-layout"))?;
    teardown.push("output-layout", move |c| c.destroy_output_layout(layout));

    let scene = comp.create_scene(layout).map_err(fail("scene"))?;
    teardown.push("scene", move |c| c.destroy_scene(scene));

    create_globals(
        comp,
        display,
        teardown,
        &[
            GlobalKind::Compositing,
            GlobalKind::DataTransfer,
            GlobalKind::PrimarySelection,
        ],
    )?;

    let seat = comp.create_seat(display, backend).map_err(fail("seat"))?;
    teardown.push("seat", move |c| c.destroy_seat(seat));

    create_globals(
        comp,
        display,
        teardown,
        &[
            GlobalKind::IdleNotifier,
            GlobalKind::IdleInhibit,
            GlobalKind::XdgShell,
            GlobalKind::XdgDecoration,
            GlobalKind::ServerDecoration {
                prefer_server_side: options.prefer_server_decorations,
            },
            GlobalKind::Presentation,
            GlobalKind::ScreenCapture,
            GlobalKind::OutputManagement,
            GlobalKind::VirtualKeyboard,
            GlobalKind::VirtualPointer,
            GlobalKind::GammaControl,
            GlobalKind::RelativePointer,
        ],
    )?;

    // The legacy display layer is best effort: each sub-step logs its own
    // failure and the chain continues either way. Sub-resources that did
    // come up are still torn down with everything else.
    let legacy_display = match comp.create_legacy_display(display) {
        Ok((legacy, name)) => {
            teardown.push("legacy-display", move |c| c.destroy_legacy_display(legacy));
            match comp.load_cursor_theme(legacy) {
                Ok(()) => {
                    if let Err(err) = comp.apply_cursor_image(legacy) {
                        warn!("cannot apply the legacy cursor image: {}", err);
                    }
                }
                Err(err) => warn!("cannot load the legacy cursor theme: {}", err),
            }
            Some(name)
        }
        Err(err) => {
            warn!("legacy display layer disabled: {}", err);
            None
        }
    };

    let socket_name = comp.add_socket(display).map_err(fail("socket"))?;
    teardown.push("socket", move |c| c.remove_socket(display));

    comp.start_backend(backend).map_err(fail("backend-start"))?;
    teardown.push("backend-start", move |c| c.stop_backend(backend));

    Ok(Subsystems {
        display,
        backend,
        socket_name,
        legacy_display,
    })
}

fn create_globals(
    comp: &mut dyn Compositor,
    display: DisplayHandle,
    teardown: &mut TeardownStack,
    kinds: &[GlobalKind],
) -> Result<(), BootstrapError> {
    for &kind in kinds {
        let step = kind.label();
        let global = comp
            .create_global(display, kind)
            .map_err(|source| BootstrapError { step, source })?;
        teardown.push(step, move |c| c.destroy_global(global));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::fake::{FakeCompositor, LegacyMode};

    fn options(policy: OutputPolicy) -> SessionOptions {
        SessionOptions {
            output_policy: policy,
            ..SessionOptions::default()
        }
    }

    fn boot(fake: &FakeCompositor, policy: OutputPolicy) -> Result<Server, BootstrapError> {
        Server::new(Box::new(fake.clone()), &options(policy))
    }

    #[test]
    fn successful_bootstrap_exposes_the_socket() {
        let fake = FakeCompositor::new();
        let server = boot(&fake, OutputPolicy::Extend).unwrap();
        assert_eq!(server.socket_name(), "wayland-fake");
        assert_eq!(server.legacy_display(), None);
        assert!(!fake.state.borrow().created().is_empty());
    }

    #[test]
    fn shutdown_tears_down_in_reverse_creation_order() {
        let fake = FakeCompositor::new();
        let server = boot(&fake, OutputPolicy::Extend).unwrap();
        server.shutdown();
        let state = fake.state.borrow();
        let mut expected = state.created();
        expected.reverse();
        assert_eq!(state.destroyed(), expected);
    }

    #[test]
    fn any_step_failure_unwinds_exactly_the_created_prefix() {
        let total = {
            let fake = FakeCompositor::new();
            boot(&fake, OutputPolicy::Extend).unwrap();
            let count = fake.state.borrow().created().len();
            count as u32
        };
        assert!(total > 20, "bootstrap chain unexpectedly short: {total}");

        for step in 0..total {
            let fake = FakeCompositor::failing_at(step);
            let err = boot(&fake, OutputPolicy::Extend)
                .err()
                .unwrap_or_else(|| panic!("injected fault at step {step} was swallowed"));
            let state = fake.state.borrow();
            let created = state.created();
            assert_eq!(created.len() as u32, step, "fault at '{}'", err.step);
            let mut expected = created.clone();
            expected.reverse();
            assert_eq!(state.destroyed(), expected, "fault at '{}'", err.step);
        }
    }

    #[test]
    fn failure_reports_the_failing_step() {
        let fake = FakeCompositor::failing_at(0);
        let err = boot(&fake, OutputPolicy::Extend).unwrap_err();
        assert_eq!(err.step, "display");

        let fake = FakeCompositor::failing_at(2);
        let err = boot(&fake, OutputPolicy::Extend).unwrap_err();
        assert_eq!(err.step, "renderer");
    }

    #[test]
    fn legacy_layer_failure_does_not_abort_bootstrap() {
        let fake = FakeCompositor::with_legacy(LegacyMode::CursorThemeFails);
        let server = boot(&fake, OutputPolicy::Extend).unwrap();
        assert_eq!(server.legacy_display(), Some(":0"));
        server.shutdown();
        // The legacy handle is part of the regular teardown.
        assert!(fake
            .state
            .borrow()
            .destroyed()
            .contains(&"legacy-display".to_string()));
    }

    #[test]
    fn client_disconnect_precedes_teardown() {
        let fake = FakeCompositor::new();
        let mut server = boot(&fake, OutputPolicy::Extend).unwrap();
        server.disconnect_clients();
        server.shutdown();
        let state = fake.state.borrow();
        let flush = state
            .log
            .iter()
            .position(|(op, _)| op == "flush")
            .expect("clients were never flushed");
        let first_destroy = state
            .log
            .iter()
            .position(|(op, _)| op == "destroy")
            .expect("nothing was torn down");
        assert!(flush < first_destroy);
    }

    #[test]
    fn extend_policy_packs_outputs_left_to_right() {
        let fake = FakeCompositor::new();
        let mut server = boot(&fake, OutputPolicy::Extend).unwrap();
        fake.announce_output(1024, 768);
        fake.announce_output(1920, 1080);
        server.dispatch_compositor_events();
        let enabled = fake.state.borrow().enabled_outputs();
        assert_eq!(enabled.len(), 2);
        let positions: Vec<(i32, i32)> = enabled.iter().map(|(_, pos)| *pos).collect();
        assert!(positions.contains(&(0, 0)));
        assert!(positions.contains(&(1024, 0)));
    }

    #[test]
    fn last_only_policy_keeps_a_single_live_output() {
        let fake = FakeCompositor::new();
        let mut server = boot(&fake, OutputPolicy::LastOnly).unwrap();
        fake.announce_output(1024, 768);
        server.dispatch_compositor_events();
        let second = fake.announce_output(1920, 1080);
        server.dispatch_compositor_events();

        let enabled = fake.state.borrow().enabled_outputs();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, fake.state.borrow().outputs[&second.0].name);
    }

    #[test]
    fn last_only_falls_back_to_newest_survivor() {
        let fake = FakeCompositor::new();
        let mut server = boot(&fake, OutputPolicy::LastOnly).unwrap();
        let first = fake.announce_output(1024, 768);
        let second = fake.announce_output(1920, 1080);
        server.dispatch_compositor_events();
        assert_eq!(fake.state.borrow().enabled_outputs().len(), 1);

        fake.retract_output(second);
        server.dispatch_compositor_events();
        let first_name = fake.state.borrow().outputs[&first.0].name.clone();
        let enabled = fake.state.borrow().enabled_outputs();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].0, first_name);
    }

    #[test]
    fn extend_recomputes_union_after_removal() {
        let fake = FakeCompositor::new();
        let mut server = boot(&fake, OutputPolicy::Extend).unwrap();
        let first = fake.announce_output(1024, 768);
        fake.announce_output(1920, 1080);
        server.dispatch_compositor_events();

        fake.retract_output(first);
        server.dispatch_compositor_events();
        let enabled = fake.state.borrow().enabled_outputs();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].1, (0, 0));
    }
}

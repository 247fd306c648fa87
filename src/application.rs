use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, info};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use renderer::config::RendererConfig;
use renderer::renderer::{create_device, pick_gpu, Renderer};
use vk_utils::swapchain::{create_surface, required_surface_extensions};
use vk_utils::vk_instance::Vulkan;
use winit::dpi::PhysicalSize;
use winit::event::{Event, StartCause, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};
use winit::window::{Window, WindowBuilder};

use crate::scene_description::book_scene;

const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Whether a wake-up is a frame tick, and when the loop wakes next. Wake-ups caused by input
/// keep the pending deadline.
fn schedule(cause: StartCause, now: Instant) -> (bool, Instant) {
    match cause {
        StartCause::Init | StartCause::Poll => (true, now + FRAME_INTERVAL),
        StartCause::ResumeTimeReached {
            requested_resume, ..
        } => (true, requested_resume.max(now) + FRAME_INTERVAL),
        StartCause::WaitCancelled {
            requested_resume, ..
        } => (false, requested_resume.unwrap_or(now + FRAME_INTERVAL)),
    }
}

pub trait ApplicationDelegate {
    fn application_will_start(&mut self, target: &EventLoopWindowTarget<()>) -> anyhow::Result<()>;
    fn application_will_update(&mut self) -> anyhow::Result<()>;
    fn application_will_quit(&mut self) -> anyhow::Result<()>;
}

pub struct Application {
    delegate: Box<dyn ApplicationDelegate>,
}

impl Application {
    pub fn new(delegate: Box<dyn ApplicationDelegate>) -> Self {
        Self { delegate }
    }

    /// Runs the event loop until the window closes or the delegate fails.
    pub fn run(mut self) -> ! {
        let event_loop = EventLoop::new();
        let mut started = false;

        event_loop.run(move |event, target, control_flow| {
            if !started {
                started = true;
                if let Err(e) = self.delegate.application_will_start(target) {
                    error!("startup failed: {:#}", e);
                    control_flow.set_exit_with_code(1);
                    return;
                }
            }

            match event {
                Event::WindowEvent {
                    event: WindowEvent::CloseRequested,
                    ..
                } => {
                    if let Err(e) = self.delegate.application_will_quit() {
                        error!("shutdown failed: {:#}", e);
                        control_flow.set_exit_with_code(1);
                    } else {
                        control_flow.set_exit();
                    }
                }
                Event::NewEvents(cause) => {
                    let (tick, deadline) = schedule(cause, Instant::now());
                    control_flow.set_wait_until(deadline);
                    if tick {
                        if let Err(e) = self.delegate.application_will_update() {
                            error!("frame failed: {:#}", e);
                            control_flow.set_exit_with_code(1);
                        }
                    }
                }
                _ => (),
            }
        })
    }
}

/// Owns the window and the renderer drawing into it.
pub struct PathTracerDelegate {
    config: RendererConfig,
    renderer: Option<Renderer>,
    window: Option<Window>,
    vulkan: Option<Rc<Vulkan>>,
}

impl PathTracerDelegate {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            vulkan: None,
        }
    }
}

impl ApplicationDelegate for PathTracerDelegate {
    fn application_will_start(&mut self, target: &EventLoopWindowTarget<()>) -> anyhow::Result<()> {
        let window = WindowBuilder::new()
            .with_title("Path Tracer")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false)
            .build(target)?;

        let display_handle = window.raw_display_handle();
        let extensions = required_surface_extensions(display_handle)?;
        let vulkan = Vulkan::new("Path Tracer", &extensions, self.config.validation)?;
        let surface = create_surface(&vulkan, display_handle, window.raw_window_handle())?;

        let gpu = pick_gpu(&vulkan)?;
        let device = create_device(&gpu, true)?;
        let scene = book_scene(&self.config)?;
        let renderer = Renderer::new(device, surface, scene, &self.config)?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        self.vulkan = Some(vulkan);
        Ok(())
    }

    fn application_will_update(&mut self) -> anyhow::Result<()> {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.render()?;
        }
        Ok(())
    }

    fn application_will_quit(&mut self) -> anyhow::Result<()> {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.wait_for_gpu()?;
            info!("stopped after {} samples", renderer.sample_index());
        }
        self.window = None;
        self.vulkan = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_wake_ups_do_not_render() {
        let now = Instant::now();
        let deadline = now + Duration::from_millis(9);
        let (tick, next) = schedule(
            StartCause::WaitCancelled {
                start: now,
                requested_resume: Some(deadline),
            },
            now,
        );
        assert!(!tick);
        assert_eq!(next, deadline);
    }

    #[test]
    fn reached_deadlines_render_and_rearm() {
        let now = Instant::now();
        let (tick, next) = schedule(
            StartCause::ResumeTimeReached {
                start: now,
                requested_resume: now,
            },
            now,
        );
        assert!(tick);
        assert_eq!(next, now + FRAME_INTERVAL);

        let (tick, _) = schedule(StartCause::Init, now);
        assert!(tick);
    }
}

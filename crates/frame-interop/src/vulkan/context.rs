//! Draw and upload contexts for Vulkan renderers.
//!
//! Vulkan has no current-context concept. Binding a context records which
//! thread renders (draw) or loads resources (upload); state setters record
//! into [`DrawState`](super::DrawState).

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::factory::VulkanSurface;
use crate::bridge::{
    ClearBits, ContextBinding, DrawSurface, ResizeOutcome, StencilAction, StencilFace,
    TestFunction,
};
use crate::region::Rect;
use crate::texture::TextureDevice;

fn register(slot: &Mutex<Option<thread::ThreadId>>, role: &str) {
    let id = thread::current().id();
    let previous = slot.lock().replace(id);
    if previous != Some(id) {
        debug!(thread = ?id, "Vulkan {role} thread registered");
    }
}

fn unregister(slot: &Mutex<Option<thread::ThreadId>>) {
    let mut slot = slot.lock();
    if *slot == Some(thread::current().id()) {
        *slot = None;
    }
}

pub struct VulkanDrawContext<D: TextureDevice> {
    surface: Arc<VulkanSurface<D>>,
}

impl<D: TextureDevice> VulkanDrawContext<D> {
    pub(crate) fn new(surface: Arc<VulkanSurface<D>>) -> Self {
        debug!("Vulkan draw context created");
        Self { surface }
    }
}

impl<D: TextureDevice> ContextBinding for VulkanDrawContext<D> {
    fn make_current(&self) {
        register(&self.surface.render_thread, "render");
    }

    fn done_current(&self) {
        unregister(&self.surface.render_thread);
    }
}

impl<D: TextureDevice> DrawSurface for VulkanDrawContext<D> {
    fn resize(&self, width: u32, height: u32) -> ResizeOutcome {
        self.surface.resize(width, height)
    }

    fn present(&self) {
        self.surface.present();
    }

    fn set_viewport(&self, x: i32, y: i32, width: u32, height: u32) {
        let rect = Rect::new(x, y, width, height);
        let mut state = self.surface.state.lock();
        state.viewport = rect;
        state.scissor = rect;
    }

    fn set_scissor(&self, x: i32, y: i32, width: u32, height: u32) {
        self.surface.state.lock().scissor = Rect::new(x, y, width, height);
    }

    fn apply_framebuffer(&self, framebuffer: Option<u32>) {
        if let Some(framebuffer) = framebuffer {
            warn!(
                framebuffer,
                "Vulkan surfaces always read back their own colour image; framebuffer ignored"
            );
        }
    }

    fn set_clear_color(&self, rgba: [f32; 4]) {
        self.surface.state.lock().clear_color = rgba;
    }

    fn clear(&self, bits: ClearBits) {
        if let Err(e) = self.surface.clear(bits) {
            warn!("Clear failed: {:#}", e);
        }
    }

    fn flush(&self) {
        if let Some(gpu) = self.surface.gpu() {
            gpu.wait_idle();
        }
    }

    fn set_depth_test_enabled(&self, enabled: bool) {
        self.surface.state.lock().depth_test = enabled;
    }

    fn set_depth_test_function(&self, function: TestFunction) {
        self.surface.state.lock().depth_function = function;
    }

    fn set_stencil_test_enabled(&self, enabled: bool) {
        self.surface.state.lock().stencil_test = enabled;
    }

    fn set_stencil_function(&self, face: StencilFace, function: TestFunction) {
        let mut state = self.surface.state.lock();
        if face.covers_front() {
            state.stencil_front.function = function;
        }
        if face.covers_back() {
            state.stencil_back.function = function;
        }
    }

    fn set_stencil_actions(
        &self,
        face: StencilFace,
        stencil_fail: StencilAction,
        depth_fail: StencilAction,
        pass: StencilAction,
    ) {
        let mut guard = self.surface.state.lock();
        let state = &mut *guard;
        for (covered, slot) in [
            (face.covers_front(), &mut state.stencil_front),
            (face.covers_back(), &mut state.stencil_back),
        ] {
            if covered {
                slot.stencil_fail = stencil_fail;
                slot.depth_fail = depth_fail;
                slot.pass = pass;
            }
        }
    }

    fn set_stencil_reference_value(&self, value: u32) {
        self.surface.state.lock().stencil_reference = value;
    }

    fn set_culling_enabled(&self, enabled: bool) {
        self.surface.state.lock().culling = enabled;
    }

    fn renderer_name(&self) -> String {
        self.surface
            .gpu()
            .map(|gpu| gpu.name().to_string())
            .unwrap_or_default()
    }

    fn renderer_version(&self) -> String {
        self.surface
            .gpu()
            .map(|gpu| gpu.version_string())
            .unwrap_or_default()
    }
}

pub struct VulkanUploadContext<D: TextureDevice> {
    surface: Arc<VulkanSurface<D>>,
}

impl<D: TextureDevice> VulkanUploadContext<D> {
    pub(crate) fn new(surface: Arc<VulkanSurface<D>>) -> Self {
        debug!("Vulkan upload context created");
        Self { surface }
    }
}

impl<D: TextureDevice> ContextBinding for VulkanUploadContext<D> {
    fn make_current(&self) {
        register(&self.surface.upload_thread, "upload");
    }

    fn done_current(&self) {
        unregister(&self.surface.upload_thread);
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use frame_interop::headless::{HeadlessGl, HeadlessTextureDevice};
use frame_interop::{
    BridgeConfig, ClearBits, FrameCallback, GlApi, HeadlessFactory, PixelFormat, Rect,
    Registration, StencilAction, StencilFace, SurfaceFactory, TestFunction,
};

fn factory_with(width: u32, height: u32, config: BridgeConfig) -> HeadlessFactory {
    HeadlessFactory::new(
        HeadlessGl::new(),
        HeadlessTextureDevice::new(),
        width,
        height,
        config,
    )
}

fn factory(width: u32, height: u32) -> HeadlessFactory {
    factory_with(width, height, BridgeConfig::default())
}

fn counter() -> (Arc<AtomicUsize>, FrameCallback) {
    let count = Arc::new(AtomicUsize::new(0));
    let callback: FrameCallback = {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (count, callback)
}

#[test]
fn present_transfers_and_notifies() {
    let factory = factory(64, 32);
    let (frames, on_frame) = counter();
    let (wakes, on_wake) = counter();
    assert_eq!(factory.set_frame_callback(Some(on_frame)), Registration::Installed);
    assert_eq!(factory.set_keep_alive_callback(Some(on_wake)), Registration::Installed);

    let draw = factory.draw_context();
    draw.make_current();
    factory.gl().paint(Rect::full(64, 32), [10, 20, 30, 255]);
    let signal = factory.present();

    assert!(signal.notified);
    assert!(signal.kept_alive);
    assert_eq!(frames.load(Ordering::SeqCst), 1);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    assert_eq!(factory.frames_transferred(), 1);
    assert_eq!(factory.device().copies(), 1);
    assert_eq!(factory.device().flushes(), 1);
    // Pending draw commands are completed before readback.
    assert_eq!(factory.gl().finish_calls(), 1);

    let generation = factory.publisher().snapshot().expect("shared texture");
    assert_eq!(generation.texture().pixel(63, 31), [30, 20, 10, 255]);
    draw.done_current();
}

#[test]
fn readback_follows_last_bound_framebuffer() {
    let factory = factory(16, 16);
    let draw = factory.draw_context();
    draw.make_current();
    let gl = factory.gl();

    // A post-processing pass renders into its own framebuffer.
    let post = gl.gen_framebuffer();
    let color = gl.gen_texture();
    gl.color_storage(color, 16, 16);
    let depth = gl.gen_renderbuffer();
    gl.depth_stencil_storage(depth, 16, 16);
    gl.attach(post, color, depth);
    gl.declare_draw_buffer(post);

    draw.apply_framebuffer(None);
    gl.paint(Rect::full(16, 16), [255, 255, 255, 255]);
    draw.apply_framebuffer(Some(post));
    gl.paint(Rect::full(16, 16), [0, 0, 255, 255]);
    draw.present();

    let shared = |x, y| {
        factory
            .publisher()
            .snapshot()
            .expect("shared texture")
            .texture()
            .pixel(x, y)
    };
    assert_eq!(shared(8, 8), [255, 0, 0, 255]);

    draw.apply_framebuffer(None);
    assert_eq!(gl.framebuffer_binding(), factory.offscreen_framebuffer());
    draw.present();
    assert_eq!(shared(8, 8), [255, 255, 255, 255]);

    draw.done_current();
}

#[test]
fn notifications_are_throttled() {
    let config = BridgeConfig {
        min_notify_interval: Duration::from_secs(3600),
        ..BridgeConfig::default()
    };
    let factory = factory_with(8, 8, config);
    let (frames, on_frame) = counter();
    factory.set_frame_callback(Some(on_frame));

    let draw = factory.draw_context();
    draw.make_current();
    for _ in 0..50 {
        draw.present();
    }
    draw.done_current();

    assert_eq!(factory.frames_transferred(), 50);
    assert_eq!(frames.load(Ordering::SeqCst), 1);
    assert_eq!(factory.notifier().dispatched(), 1);
    assert_eq!(factory.notifier().suppressed(), 49);
}

#[test]
fn keep_alive_runs_for_budget_only() {
    let factory = factory(8, 8);
    let (wakes, on_wake) = counter();
    factory.set_keep_alive_callback(Some(on_wake));

    let draw = factory.draw_context();
    draw.make_current();
    let budget = BridgeConfig::default().keep_alive_frames as usize;
    for presented in 1..=budget + 10 {
        draw.present();
        assert_eq!(
            wakes.load(Ordering::SeqCst),
            presented.min(budget),
            "after present {presented}"
        );
    }
    draw.done_current();
    assert_eq!(factory.notifier().remaining_keep_alive(), 0);
}

#[test]
fn dropped_frame_still_keeps_alive() {
    let factory = factory(32, 32);
    let (frames, on_frame) = counter();
    let (wakes, on_wake) = counter();
    factory.set_frame_callback(Some(on_frame));
    factory.set_keep_alive_callback(Some(on_wake));

    let draw = factory.draw_context();
    draw.make_current();
    draw.set_viewport(4096, 4096, 16, 16);
    let signal = factory.present();
    draw.done_current();

    assert!(!signal.notified);
    assert!(signal.kept_alive);
    assert_eq!(frames.load(Ordering::SeqCst), 0);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    assert_eq!(factory.frames_transferred(), 0);
    assert_eq!(factory.device().copies(), 0);
}

#[test]
fn shutdown_silences_and_rejects_callbacks() {
    let factory = factory(8, 8);
    let (frames, on_frame) = counter();
    factory.set_frame_callback(Some(on_frame));
    factory.shutdown();

    let (_, late) = counter();
    assert_eq!(factory.set_frame_callback(Some(late)), Registration::Rejected);

    let draw = factory.draw_context();
    draw.make_current();
    let signal = factory.present();
    draw.done_current();

    assert!(!signal.notified);
    assert!(!signal.kept_alive);
    assert_eq!(frames.load(Ordering::SeqCst), 0);
    // The frame itself is still transferred.
    assert_eq!(factory.frames_transferred(), 1);
}

#[test]
fn sample_reflects_current_generation() {
    let factory = factory(800, 600);
    let first = factory.sample(0, 0).expect("descriptor");
    assert_eq!((first.width, first.height), (800, 600));
    assert_eq!((first.visible_width, first.visible_height), (800, 600));
    assert_eq!(first.format, PixelFormat::Bgra8);
    assert!(!first.has_release_callback);
    assert_eq!(first.handle, factory.shared_texture_handle());

    factory.set_surface_size(1024, 768);
    let second = factory.sample(640, 480).expect("descriptor");
    assert_ne!(second.handle, first.handle);
    assert_eq!((second.width, second.height), (1024, 768));
    assert_eq!((second.visible_width, second.visible_height), (640, 480));
    assert!(!factory.d3d11_device().is_null());
    assert!(!factory.d3d11_texture().is_null());
}

#[test]
fn renderer_state_reaches_gl() {
    let factory = factory(8, 8);
    let draw = factory.draw_context();
    draw.make_current();
    let gl = factory.gl();

    draw.set_depth_test_enabled(true);
    draw.set_depth_test_function(TestFunction::LessOrEqual);
    assert!(gl.is_enabled(gl::DEPTH_TEST));
    assert_eq!(gl.depth_function(), Some(gl::LEQUAL));

    draw.set_stencil_test_enabled(true);
    draw.set_stencil_function(StencilFace::Front, TestFunction::Equal);
    draw.set_stencil_function(StencilFace::Back, TestFunction::NotEqual);
    draw.set_stencil_reference_value(7);
    assert!(gl.is_enabled(gl::STENCIL_TEST));
    assert_eq!(gl.stencil_function(gl::FRONT), Some((gl::EQUAL, 7, 0xFF)));
    assert_eq!(gl.stencil_function(gl::BACK), Some((gl::NOTEQUAL, 7, 0xFF)));

    draw.set_stencil_actions(
        StencilFace::Back,
        StencilAction::Keep,
        StencilAction::Zero,
        StencilAction::Replace,
    );
    assert_eq!(gl.stencil_actions(gl::BACK), Some([gl::KEEP, gl::ZERO, gl::REPLACE]));
    assert_eq!(gl.stencil_actions(gl::FRONT), Some([gl::KEEP; 3]));

    draw.set_culling_enabled(true);
    assert!(gl.is_enabled(gl::CULL_FACE));

    draw.set_clear_color([1.0, 0.0, 0.0, 1.0]);
    draw.clear(ClearBits::COLOR | ClearBits::DEPTH);
    assert_eq!(gl.clear_color_value(), Some([1.0, 0.0, 0.0, 1.0]));
    draw.present();
    let generation = factory.publisher().snapshot().expect("shared texture");
    assert_eq!(generation.texture().pixel(0, 0), [0, 0, 255, 255]);

    draw.done_current();
}

#[test]
fn state_calls_without_current_context_are_ignored() {
    let factory = factory(8, 8);
    let draw = factory.draw_context();
    draw.set_viewport(1, 1, 2, 2);
    draw.set_depth_test_enabled(true);

    draw.make_current();
    assert_eq!(factory.gl().current_viewport(), Rect::full(8, 8));
    assert!(!factory.gl().is_enabled(gl::DEPTH_TEST));
    draw.done_current();
}

#[test]
fn contexts_are_created_lazily_and_bind_independently() {
    let factory = factory(8, 8);
    assert!(!factory.is_draw_context_created());
    assert!(!factory.is_upload_context_created());

    let draw = factory.draw_context();
    draw.make_current();
    assert!(factory.is_draw_context_created());
    assert!(!factory.is_upload_context_created());

    thread::scope(|s| {
        s.spawn(|| {
            let upload = factory.upload_context();
            upload.make_current();
            assert_eq!(factory.gl().current_context(), Some(factory.gl().upload_context()));
            upload.done_current();
            assert_eq!(factory.gl().current_context(), None);
        });
    });

    assert!(factory.is_upload_context_created());
    assert_eq!(factory.gl().current_context(), Some(factory.gl().draw_context()));
    assert_eq!(factory.gl().framebuffer_binding(), factory.offscreen_framebuffer());
    draw.done_current();
    assert_eq!(factory.gl().current_context(), None);
}

use std::sync::mpsc;
use std::thread;

use frame_interop::headless::{HeadlessGl, HeadlessTextureDevice};
use frame_interop::{BridgeConfig, GlApi, HeadlessFactory, Rect, ResizeOutcome, SurfaceFactory};

const RED: [u8; 4] = [255, 0, 0, 255];
const GREEN: [u8; 4] = [0, 255, 0, 255];
const BGRA_RED: [u8; 4] = [0, 0, 255, 255];
const BGRA_GREEN: [u8; 4] = [0, 255, 0, 255];
const BGRA_BLACK: [u8; 4] = [0, 0, 0, 255];

fn factory(width: u32, height: u32) -> HeadlessFactory {
    HeadlessFactory::new(
        HeadlessGl::new(),
        HeadlessTextureDevice::new(),
        width,
        height,
        BridgeConfig::default(),
    )
}

fn shared_pixel(factory: &HeadlessFactory, x: u32, y: u32) -> [u8; 4] {
    let generation = factory.publisher().snapshot().expect("shared texture");
    generation.texture().pixel(x, y)
}

#[test]
fn resize_mid_render_keeps_old_content_top_left() {
    let factory = factory(800, 600);
    assert!(factory.is_valid());
    let draw = factory.draw_context();
    draw.make_current();

    assert!(factory.gl().paint(Rect::full(800, 600), RED));
    draw.present();
    assert_eq!(shared_pixel(&factory, 0, 0), BGRA_RED);
    assert_eq!(shared_pixel(&factory, 799, 599), BGRA_RED);

    assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Resized);
    // The renderer has not caught up: it still draws an 800x600 frame.
    draw.set_viewport(0, 0, 800, 600);
    assert!(factory.gl().paint(Rect::full(1024, 768), GREEN));
    draw.present();

    assert_eq!(factory.dimensions(), (1024, 768));
    let descriptor = factory.sample(0, 0).expect("descriptor");
    assert_eq!((descriptor.width, descriptor.height), (1024, 768));

    let generation = factory.publisher().snapshot().expect("shared texture");
    let texture = generation.texture();
    assert_eq!(texture.dimensions(), (1024, 768));
    for (x, y) in [(0, 0), (799, 0), (0, 599), (799, 599), (400, 300)] {
        assert_eq!(texture.pixel(x, y), BGRA_GREEN, "rendered pixel ({x}, {y})");
    }
    for (x, y) in [(800, 0), (1023, 0), (0, 600), (1023, 767), (900, 700)] {
        assert_eq!(texture.pixel(x, y), BGRA_BLACK, "cleared pixel ({x}, {y})");
    }
    assert!(texture.pixels().chunks_exact(4).all(|px| px[3] == 255));

    draw.done_current();
}

#[test]
fn resize_to_same_size_keeps_handle() {
    let factory = factory(640, 480);
    let open_before = factory.device().open_handles();

    assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Resized);
    let handle = factory.shared_texture_handle();
    let generation = factory.publisher().snapshot().map(|g| g.id());

    assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Unchanged);
    assert_eq!(factory.shared_texture_handle(), handle);
    assert_eq!(factory.publisher().snapshot().map(|g| g.id()), generation);
    assert_eq!(factory.device().open_handles(), open_before);
}

#[test]
fn resize_resets_viewport_and_scissor() {
    let factory = factory(320, 240);
    let draw = factory.draw_context();
    draw.make_current();
    draw.set_viewport(10, 10, 20, 20);
    draw.set_scissor(0, 0, 1, 1);

    assert_eq!(draw.resize(1280, 720), ResizeOutcome::Resized);
    let gl = factory.gl();
    assert_eq!(gl.current_viewport(), Rect::full(1280, 720));
    assert_eq!(gl.current_scissor(), Rect::full(1280, 720));
    assert_eq!(gl.framebuffer_binding(), factory.offscreen_framebuffer());
    assert_eq!(
        gl.framebuffer_status(factory.offscreen_framebuffer()),
        gl::FRAMEBUFFER_COMPLETE
    );

    draw.done_current();
}

#[test]
fn resize_restores_foreign_context() {
    let factory = factory(256, 256);
    let gl = factory.gl();
    let foreign = gl.create_foreign_context();
    assert!(gl.make_current(Some(foreign)));

    assert_eq!(factory.set_surface_size(512, 512), ResizeOutcome::Resized);
    assert_eq!(gl.current_context(), Some(foreign));

    assert_eq!(factory.draw_context().renderer_name(), "Headless GL");
    assert_eq!(factory.draw_context().renderer_version(), "3.3 (headless)");
    assert_eq!(gl.current_context(), Some(foreign));

    assert!(gl.make_current(None));
}

#[test]
fn resize_without_current_context_releases_it_again() {
    let factory = factory(64, 64);
    assert_eq!(factory.gl().current_context(), None);
    assert_eq!(factory.set_surface_size(128, 64), ResizeOutcome::Resized);
    assert_eq!(factory.gl().current_context(), None);
    assert_eq!(factory.gl().draw_context_owner(), None);
}

#[test]
fn resize_while_draw_thread_busy_is_deferred() {
    let factory = factory(800, 600);
    let (bound_tx, bound_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let factory = &factory;
        s.spawn(move || {
            let draw = factory.draw_context();
            draw.make_current();
            bound_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            // The pending size is applied before the transfer.
            draw.present();
            draw.done_current();
        });

        bound_rx.recv().unwrap();
        assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Deferred);
        assert_eq!(factory.pending_size(), Some((1024, 768)));
        assert_eq!(factory.dimensions(), (800, 600));
        resume_tx.send(()).unwrap();
    });

    assert_eq!(factory.pending_size(), None);
    assert_eq!(factory.dimensions(), (1024, 768));
    assert_eq!(factory.frames_transferred(), 1);
}

#[test]
fn deferred_resize_keeps_the_frame_drawn_before_it() {
    let factory = factory(800, 600);
    let (bound_tx, bound_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let factory = &factory;
        s.spawn(move || {
            let draw = factory.draw_context();
            draw.make_current();
            assert!(factory.gl().paint(Rect::full(800, 600), RED));
            bound_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            draw.present();
            draw.done_current();
        });

        bound_rx.recv().unwrap();
        assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Deferred);
        resume_tx.send(()).unwrap();
    });

    assert_eq!(factory.dimensions(), (1024, 768));
    let generation = factory.publisher().snapshot().expect("shared texture");
    let texture = generation.texture();
    assert_eq!(texture.dimensions(), (1024, 768));
    for (x, y) in [(0, 0), (799, 0), (0, 599), (799, 599)] {
        assert_eq!(texture.pixel(x, y), BGRA_RED, "drawn pixel ({x}, {y})");
    }
    for (x, y) in [(800, 0), (0, 600), (1023, 767)] {
        assert_eq!(texture.pixel(x, y), BGRA_BLACK, "uncovered pixel ({x}, {y})");
    }
    assert!(texture.pixels().chunks_exact(4).all(|px| px[3] == 255));
    assert_eq!(factory.frames_transferred(), 1);
}

#[test]
fn resize_on_draw_thread_keeps_renderer_framebuffer_bound() {
    let factory = factory(16, 16);
    let draw = factory.draw_context();
    draw.make_current();
    let gl = factory.gl();

    let post = gl.gen_framebuffer();
    let color = gl.gen_texture();
    gl.color_storage(color, 16, 16);
    let depth = gl.gen_renderbuffer();
    gl.depth_stencil_storage(depth, 16, 16);
    gl.attach(post, color, depth);
    gl.declare_draw_buffer(post);
    draw.apply_framebuffer(Some(post));

    assert_eq!(draw.resize(32, 32), ResizeOutcome::Resized);
    assert_eq!(gl.framebuffer_binding(), post);

    draw.apply_framebuffer(None);
    assert_eq!(gl.framebuffer_binding(), factory.offscreen_framebuffer());
    draw.done_current();
}

#[test]
fn deferred_resize_applies_on_make_current() {
    let factory = factory(100, 100);
    let (bound_tx, bound_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let factory = &factory;
        s.spawn(move || {
            let draw = factory.draw_context();
            draw.make_current();
            bound_tx.send(()).unwrap();
            resume_rx.recv().unwrap();
            draw.done_current();
        });
        bound_rx.recv().unwrap();
        assert_eq!(factory.set_surface_size(200, 150), ResizeOutcome::Deferred);
        resume_tx.send(()).unwrap();
    });
    assert_eq!(factory.dimensions(), (100, 100));

    let draw = factory.draw_context();
    draw.make_current();
    assert_eq!(factory.dimensions(), (200, 150));
    assert_eq!(factory.gl().current_viewport(), Rect::full(200, 150));
    draw.done_current();
}

#[test]
fn failed_texture_allocation_keeps_previous_size() {
    let factory = factory(800, 600);
    let handle = factory.shared_texture_handle();

    factory.device().fail_allocations(1);
    assert_eq!(factory.set_surface_size(1024, 768), ResizeOutcome::Failed);

    assert!(factory.is_valid());
    assert_eq!(factory.dimensions(), (800, 600));
    assert!(!factory.shared_texture_handle().is_null());
    assert_ne!(factory.shared_texture_handle(), handle);
    assert_eq!(factory.device().open_handles(), 1);

    // The render target followed the roll back.
    let draw = factory.draw_context();
    draw.make_current();
    assert_eq!(factory.gl().current_viewport(), Rect::full(800, 600));
    draw.done_current();
}

#[test]
fn incomplete_framebuffer_fails_resize() {
    let factory = factory(300, 200);
    let handle = factory.shared_texture_handle();

    factory.gl().set_incomplete_framebuffers(true);
    assert_eq!(factory.set_surface_size(600, 400), ResizeOutcome::Failed);
    assert_eq!(factory.dimensions(), (300, 200));
    assert_eq!(factory.shared_texture_handle(), handle);

    factory.gl().set_incomplete_framebuffers(false);
    assert_eq!(factory.set_surface_size(600, 400), ResizeOutcome::Resized);
    assert_eq!(factory.dimensions(), (600, 400));
}

#[test]
fn zero_size_is_rejected() {
    let factory = factory(32, 32);
    assert_eq!(factory.set_surface_size(0, 32), ResizeOutcome::Failed);
    assert_eq!(factory.set_surface_size(32, 0), ResizeOutcome::Failed);
    assert_eq!(factory.dimensions(), (32, 32));
}

#[test]
fn failed_construction_reports_invalid() {
    let device = HeadlessTextureDevice::new();
    device.fail_allocations(1);
    let factory = HeadlessFactory::new(HeadlessGl::new(), device, 64, 64, BridgeConfig::default());

    assert!(!factory.is_valid());
    assert!(factory.shared_texture_handle().is_null());
    assert!(factory.sample(64, 64).is_none());
    assert_eq!(factory.dimensions(), (0, 0));
}

#[test]
fn drop_releases_gl_objects_and_handles() {
    let gl = HeadlessGl::new();
    let factory = HeadlessFactory::new(gl, HeadlessTextureDevice::new(), 64, 64, BridgeConfig::default());
    assert_eq!(factory.gl().live_objects(), (1, 1, 1));
    assert_eq!(factory.set_surface_size(128, 128), ResizeOutcome::Resized);
    assert_eq!(factory.gl().live_objects(), (1, 1, 1));

    let generation = factory.publisher().snapshot().expect("shared texture");
    let publisher = factory.publisher().clone();
    drop(factory);

    assert!(publisher.snapshot().is_none());
    // A sampler still holding the last generation keeps its handle open.
    assert_eq!(publisher.device().open_handles(), 1);
    drop(generation);
    assert_eq!(publisher.device().open_handles(), 0);
}

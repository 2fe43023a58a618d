use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frame_bridge::{Backend, BridgeHost, HostConfig};
use frame_interop::headless::HeadlessTextureDevice;
use frame_interop::{
    BridgeConfig, FrameCallback, HeadlessFactory, PixelFormat, Registration, ResizeOutcome,
};

fn host() -> BridgeHost {
    BridgeHost::new(HostConfig {
        backend: Backend::Headless,
        ..HostConfig::default()
    })
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

fn present(host: &BridgeHost) {
    host.with_draw_context(|draw| {
        draw.make_current();
        draw.present();
        draw.done_current();
    })
    .expect("surface");
}

#[test]
fn callbacks_registered_before_surface_are_installed() {
    let host = host();
    let (frames, on_frame) = counter();
    let (wakes, on_wake) = counter();
    assert_eq!(host.set_frame_callback(Some(on_frame)), Registration::Installed);
    assert_eq!(host.set_keep_alive_callback(Some(on_wake)), Registration::Installed);

    host.create_surface(64, 48, 1.5).expect("create");
    assert!(host.has_surface());
    assert_eq!(host.density(), 1.5);
    present(&host);

    assert_eq!(frames.load(Ordering::SeqCst), 1);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
}

#[test]
fn sample_and_handles_follow_the_surface() {
    let host = host();
    assert!(host.sample(0, 0).is_none());
    assert!(host.shared_texture_handle().is_null());
    assert_eq!(host.on_size_changed(10, 10), None);

    host.create_surface(800, 600, 1.0).expect("create");
    let first = host.sample(0, 0).expect("descriptor");
    assert_eq!((first.width, first.height), (800, 600));
    assert_eq!(first.format, PixelFormat::Bgra8);
    assert_eq!(first.handle, host.shared_texture_handle());
    assert!(!host.d3d11_device().is_null());
    assert!(!host.d3d11_texture().is_null());

    assert_eq!(host.on_size_changed(1024, 768), Some(ResizeOutcome::Resized));
    assert_eq!(host.on_size_changed(1024, 768), Some(ResizeOutcome::Unchanged));
    assert_eq!(host.on_size_changed(0, 768), Some(ResizeOutcome::Failed));
    let second = host.sample(512, 0).expect("descriptor");
    assert_ne!(second.handle, first.handle);
    assert_eq!((second.visible_width, second.visible_height), (512, 768));
}

#[test]
fn destroy_silences_notifications_and_releases_handles() {
    let host = host();
    let (frames, on_frame) = counter();
    host.set_frame_callback(Some(on_frame));
    host.create_surface(32, 32, 1.0).expect("create");

    let surface = host.surface().expect("surface");
    assert!(host.destroy_surface());
    assert!(!host.destroy_surface());
    assert!(!host.has_surface());
    assert!(host.shared_texture_handle().is_null());
    assert!(!host.notify_frame_ready());

    // A renderer still holding the factory presents into a silenced surface.
    let draw = surface.draw_context();
    draw.make_current();
    draw.present();
    draw.done_current();
    assert_eq!(frames.load(Ordering::SeqCst), 0);

    let headless = surface
        .as_any()
        .downcast_ref::<HeadlessFactory>()
        .expect("headless factory");
    let device: &HeadlessTextureDevice = headless.device();
    assert_eq!(device.open_handles(), 1);
    drop(surface);
}

#[test]
fn recreated_surface_keeps_retained_callbacks() {
    let host = host();
    let (frames, on_frame) = counter();
    host.set_frame_callback(Some(on_frame));

    host.create_surface(16, 16, 1.0).expect("create");
    host.destroy_surface();
    host.create_surface(16, 16, 1.0).expect("recreate");
    present(&host);

    assert_eq!(frames.load(Ordering::SeqCst), 1);
}

#[test]
fn create_replaces_existing_surface() {
    let host = host();
    host.create_surface(16, 16, 1.0).expect("create");
    let first = host.surface().expect("surface");
    host.create_surface(32, 32, 2.0).expect("replace");

    assert!(!Arc::ptr_eq(&first, &host.surface().expect("surface")));
    assert!(!first.notifier().is_enabled());
    assert_eq!(host.density(), 2.0);
    assert_eq!(host.sample(0, 0).map(|d| (d.width, d.height)), Some((32, 32)));
}

#[test]
fn invalid_sizes_are_rejected() {
    let host = host();
    assert!(host.create_surface(0, 10, 1.0).is_err());
    assert!(host.create_surface(10, -4, 1.0).is_err());
    assert!(!host.has_surface());
}

#[test]
fn notify_frame_ready_is_rate_limited() {
    let host = BridgeHost::new(HostConfig {
        backend: Backend::Headless,
        bridge: BridgeConfig {
            min_notify_interval: Duration::from_secs(3600),
            ..BridgeConfig::default()
        },
        ..HostConfig::default()
    });
    let (frames, on_frame) = counter();
    host.create_surface(8, 8, 1.0).expect("create");
    assert_eq!(host.set_frame_callback(Some(on_frame)), Registration::Installed);

    assert!(host.notify_frame_ready());
    assert!(!host.notify_frame_ready());
    assert_eq!(frames.load(Ordering::SeqCst), 1);
}

#[test]
fn upload_context_is_reachable() {
    let host = host();
    assert!(host.with_upload_context(|_| ()).is_none());
    host.create_surface(8, 8, 1.0).expect("create");
    host.with_upload_context(|upload| {
        upload.make_current();
        upload.done_current();
    })
    .expect("surface");
    assert!(host.surface().expect("surface").is_upload_context_created());
}

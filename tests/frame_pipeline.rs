use std::sync::Arc;
use std::time::Duration;

use ultraviolet::Vec3;

use frame_tracer::camera::{orbit_controller::OrbitController, Camera};
use frame_tracer::host::{HostBuffer, HostCommand, HostDevice, HostDeviceConfig, HostIntersector};
use frame_tracer::render::frame_sync::FrameState;
use frame_tracer::render::shader_types::pack_color;
use frame_tracer::render::technique::FrameBuffer;
use frame_tracer::{ErrorKind, FrameSettings, Params, Scene, Technique, TraceContext};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

type HostContext = TraceContext<HostDevice, HostIntersector>;

fn init_with(
    config: HostDeviceConfig,
    scene: &Scene,
    technique: Technique,
) -> (Arc<HostDevice>, Arc<HostIntersector>, HostContext) {
    let device = Arc::new(HostDevice::new(config));
    let engine = Arc::new(HostIntersector::default());
    let context = TraceContext::init(
        device.clone(),
        engine.clone(),
        scene,
        WIDTH * HEIGHT,
        technique,
        FrameSettings::default(),
    )
    .unwrap();
    (device, engine, context)
}

fn init(technique: Technique) -> (Arc<HostDevice>, HostContext) {
    let (device, _, context) = init_with(
        HostDeviceConfig::default(),
        &Scene::single_triangle(),
        technique,
    );
    (device, context)
}

/// Looks at the origin from `distance` along +z, rotated by `yaw`.
fn view(yaw: f32, distance: f32) -> Params {
    let mut orbit = OrbitController::new(Vec3::zero(), distance, 1.0);
    orbit.rotate(yaw, 0.0);
    let mut camera = Camera::new(Default::default());
    camera.update_camera(&orbit);
    camera.view_params(WIDTH, HEIGHT, 1.0)
}

fn center(color: &[u32]) -> u32 {
    color[(HEIGHT / 2 * WIDTH + WIDTH / 2) as usize]
}

/// Checks the recorded frame command by command. Barriers have to cover exactly
/// the listed buffers, everything else lists none.
fn assert_recorded(context: &HostContext, expected: &[(&str, &[FrameBuffer])]) {
    let commands = context.frame_commands().unwrap();
    let labels: Vec<String> = expected.iter().map(|(label, _)| label.to_string()).collect();
    assert_eq!(commands.labels(), labels);

    let recorded = commands.commands().iter().zip(expected).enumerate();
    for (index, (command, (label, covered))) in recorded {
        let expected_buffers: Vec<HostBuffer> = covered
            .iter()
            .map(|&buffer| context.resources().buffer(buffer).unwrap().clone())
            .collect();
        match command {
            HostCommand::Barrier { buffers, .. } => {
                assert_eq!(buffers, &expected_buffers, "command {} ({})", index, label)
            }
            _ => assert!(covered.is_empty(), "command {} ({})", index, label),
        }
    }
}

#[test]
fn ambient_occlusion_frame_is_recorded_with_barriers() {
    use FrameBuffer::*;
    let (_, context) = init(Technique::ambient_occlusion());

    assert_recorded(
        &context,
        &[
            ("dispatch camera_rays", &[]),
            (
                "barrier compute>compute",
                &[CameraRays, SecondaryCount, Accumulation, Color],
            ),
            ("trace", &[]),
            ("barrier compute>compute", &[Hits, SecondaryCount, TraceScratch]),
            ("dispatch ao_rays", &[]),
            (
                "barrier compute>compute",
                &[SecondaryRays, SecondaryCount, SecondaryIds],
            ),
            ("trace indirect", &[]),
            ("barrier compute>compute", &[SecondaryHits]),
            ("dispatch ao_rays_resolve", &[]),
            ("barrier compute>transfer", &[Color]),
            ("barrier compute>host", &[Color]),
        ],
    );
}

#[test]
fn path_trace_frame_clears_the_counter_first() {
    use FrameBuffer::*;
    let (_, context) = init(Technique::path_trace());

    assert_recorded(
        &context,
        &[
            ("dispatch clear_counter", &[]),
            ("barrier compute>compute", &[SecondaryCount]),
            ("dispatch pt_camera_rays", &[]),
            ("barrier compute>compute", &[CameraRays, Accumulation, Color]),
            ("trace", &[]),
            ("barrier compute>compute", &[Hits, SecondaryCount, TraceScratch]),
            ("dispatch bounce_rays", &[]),
            (
                "barrier compute>compute",
                &[SecondaryRays, SecondaryCount, SecondaryIds, Accumulation, Color],
            ),
            ("trace indirect", &[]),
            ("barrier compute>compute", &[SecondaryHits]),
            ("dispatch shade", &[]),
            ("barrier compute>transfer", &[Color]),
            ("barrier compute>host", &[Color]),
        ],
    );
}

#[test]
fn ambient_occlusion_of_an_unoccluded_triangle_is_white() {
    let (_, mut context) = init(Technique::ambient_occlusion());
    assert_eq!(context.num_rays(), WIDTH * HEIGHT);

    context.update_view(view(0.0, 3.0)).unwrap();
    context.submit().unwrap();
    let color = context.color().unwrap();

    assert_eq!(color.len(), (WIDTH * HEIGHT) as usize);
    assert_eq!(center(&color), pack_color(Vec3::one()));
    // corners look past the triangle and never spawn occlusion rays
    assert_eq!(color[0], 0);
    assert_eq!(color[color.len() - 1], 0);
}

#[test]
fn path_trace_shows_sky_around_the_triangle() {
    let (_, mut context) = init(Technique::path_trace());

    context.update_view(view(0.0, 3.0)).unwrap();
    context.submit().unwrap();
    let color = context.color().unwrap();

    let sky = pack_color(Vec3::new(0.8, 0.85, 1.0));
    assert_eq!(color[0], sky);
    assert_ne!(center(&color), sky);
    assert_ne!(center(&color), 0);
}

#[test]
fn samples_accumulate_until_the_view_changes() {
    let (_, mut context) = init(Technique::ambient_occlusion());

    for expected in 0..3 {
        let stamped = context.update_view(view(0.0, 3.0)).unwrap();
        assert_eq!(stamped.sample_index(), expected);
        context.submit().unwrap();
    }
    assert_eq!(context.sample_index(), 2);

    let stamped = context.update_view(view(0.3, 3.0)).unwrap();
    assert_eq!(stamped.sample_index(), 0);
    context.submit().unwrap();
    assert_eq!(context.frames_submitted(), 4);
    assert_eq!(center(&context.color().unwrap()), pack_color(Vec3::one()));
}

#[test]
fn first_frame_is_sample_zero_even_for_an_empty_view() {
    let (_, mut context) = init(Technique::ambient_occlusion());

    let stamped = context.update_view(Params::default()).unwrap();
    assert_eq!(stamped.sample_index(), 0);
    assert_eq!(context.sample_index(), 0);
}

#[test]
fn fence_gates_host_access() {
    let config = HostDeviceConfig {
        completion_delay: Duration::from_millis(200),
        ..HostDeviceConfig::default()
    };
    let (device, _, mut context) = init_with(
        config,
        &Scene::single_triangle(),
        Technique::ambient_occlusion(),
    );
    assert!(context.fence_signaled().unwrap());
    assert_eq!(context.frame_state(), FrameState::Idle);

    context.update_view(view(0.0, 3.0)).unwrap();
    assert_eq!(context.frame_state(), FrameState::HostWriting);
    assert!(!context.fence_signaled().unwrap());

    context.submit().unwrap();
    assert_eq!(context.frame_state(), FrameState::InFlight);
    assert!(!context.fence_signaled().unwrap());

    context.color().unwrap();
    assert!(context.fence_signaled().unwrap());
    assert_eq!(context.frame_state(), FrameState::Idle);
    assert_eq!(device.completed(), device.submitted());
}

#[test]
fn rejected_submission_can_be_retried() {
    let (device, mut context) = init(Technique::ambient_occlusion());
    context.update_view(view(0.0, 3.0)).unwrap();

    device.set_reject_submissions(true);
    let err = context.submit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubmissionFailure);
    assert_eq!(context.frames_submitted(), 0);
    assert_eq!(context.frame_state(), FrameState::HostWriting);

    device.set_reject_submissions(false);
    context.submit().unwrap();
    assert_eq!(context.frames_submitted(), 1);
    assert_eq!(center(&context.color().unwrap()), pack_color(Vec3::one()));
}

#[test]
fn oversized_screen_dimensions_still_complete() {
    let (_, mut context) = init(Technique::ambient_occlusion());
    let mut params = view(0.0, 3.0);
    params.screen_dims = [70000.0, 70000.0, 1.0 / 70000.0, 1.0 / 70000.0];

    context.update_view(params).unwrap();
    context.submit().unwrap();
    assert_eq!(context.color().unwrap().len(), (WIDTH * HEIGHT) as usize);
    assert_eq!(context.frame_state(), FrameState::Idle);
}

#[test]
fn color_can_be_overwritten_between_frames() {
    let (_, mut context) = init(Technique::path_trace());
    let seed: Vec<u32> = (0..WIDTH * HEIGHT).collect();

    context.set_color(&seed).unwrap();
    assert_eq!(context.color().unwrap(), seed);

    let err = context.set_color(&seed[1..]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BindingContractViolation);
}

#[test]
fn larger_scenes_render() {
    let (_, engine, mut context) = init_with(
        HostDeviceConfig::default(),
        &Scene::ground_with_boxes(3),
        Technique::path_trace(),
    );
    assert_eq!(engine.live_structures(), 5);
    assert_eq!(context.structures().bottom_level().len(), 4);

    let mut orbit = OrbitController::new(Vec3::new(0.0, 1.0, 0.0), 10.0, 1.0);
    orbit.rotate(0.0, 0.4);
    let mut camera = Camera::new(Default::default());
    camera.update_camera(&orbit);
    context
        .update_view(camera.view_params(WIDTH, HEIGHT, 1.0))
        .unwrap();
    context.submit().unwrap();

    let color = context.color().unwrap();
    assert!(color.iter().all(|&pixel| pixel >> 24 == 0xFF));
}

#[test]
fn failed_init_releases_everything() {
    let device = Arc::new(HostDevice::new(HostDeviceConfig {
        memory_budget: 4096,
        ..HostDeviceConfig::default()
    }));
    let engine = Arc::new(HostIntersector::default());

    let err = TraceContext::init(
        device.clone(),
        engine.clone(),
        &Scene::single_triangle(),
        64 * 64,
        Technique::ambient_occlusion(),
        FrameSettings::default(),
    )
    .err()
    .unwrap();

    assert_eq!(err.kind(), ErrorKind::LoadFatal);
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(engine.live_structures(), 0);
}

#[test]
fn dropping_the_context_releases_everything() {
    let (device, engine, mut context) = init_with(
        HostDeviceConfig::default(),
        &Scene::cornell_box(),
        Technique::ambient_occlusion(),
    );
    context.update_view(view(0.0, 3.0)).unwrap();
    context.submit().unwrap();

    drop(context);
    assert_eq!(device.live_allocations(), 0);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(engine.live_structures(), 0);
}

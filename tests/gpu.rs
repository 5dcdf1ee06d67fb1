use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};
use winit::keyboard::KeyCode;

use deferred_rsm::app::apply_key_bindings;
use deferred_rsm::material::MaterialTextures;
use deferred_rsm::mesh::MeshData;
use deferred_rsm::shading::{GBufferTexel, RsmImage, RsmTexel, ShadingContext};
use deferred_rsm::texture::TextureCache;
use deferred_rsm::{
    Camera, DeferredRenderer, Flashlight, GpuContext, Incompleteness, InputState, Instance,
    Model, Projection, RenderError, RendererParams, RenderTargetDesc, RenderTargetSet,
    RenderTargetSize, StaticViewport, ViewportProvider, WindowViewport,
};

const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

fn gpu() -> Option<GpuContext> {
    match pollster::block_on(GpuContext::headless()) {
        Ok(ctx) => Some(ctx),
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
    }
}

fn camera() -> Camera {
    Camera::new(Vec3::new(0.0, 0.0, 2.0), 0.0, 0.0)
}

fn output_texture(ctx: &GpuContext, width: u32, height: u32) -> wgpu::Texture {
    output_texture_as(ctx, width, height, OUTPUT_FORMAT)
}

fn output_texture_as(
    ctx: &GpuContext,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> wgpu::Texture {
    ctx.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("test-output"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Width must keep rows 256-byte aligned.
fn read_pixels(ctx: &GpuContext, texture: &wgpu::Texture, width: u32, height: u32) -> Vec<u8> {
    let bytes_per_row = width * 4;
    let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback"),
        size: (bytes_per_row * height) as u64,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
    encoder.copy_texture_to_buffer(
        texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    ctx.queue.submit(Some(encoder.finish()));
    let slice = buffer.slice(..);
    slice.map_async(wgpu::MapMode::Read, |result| result.expect("map readback"));
    ctx.device.poll(wgpu::PollType::Wait).expect("poll device");
    let data = slice.get_mapped_range().to_vec();
    data
}

/// 4x4 quad in the z = 0 plane facing +Z.
fn facing_quad() -> MeshData {
    let mut mesh = MeshData {
        name: "quad".to_string(),
        positions: vec![
            Vec3::new(-2.0, -2.0, 0.0),
            Vec3::new(2.0, -2.0, 0.0),
            Vec3::new(2.0, 2.0, 0.0),
            Vec3::new(-2.0, 2.0, 0.0),
        ],
        colors: vec![Vec3::ONE; 4],
        tex_coords: vec![
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 0.0),
        ],
        normals: vec![Vec3::Z; 4],
        indices: vec![0, 1, 2, 0, 2, 3],
        ..MeshData::default()
    };
    mesh.compute_tangent_space();
    mesh
}

#[test]
fn resize_reallocates_gbuffer_and_stays_complete() {
    let Some(ctx) = gpu() else { return };
    let viewport = WindowViewport::new(640, 480);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    assert_eq!(renderer.gbuffer().size(), (640, 480));
    let generation = renderer.gbuffer().generation();
    let rsm_generation = renderer.rsm().generation();

    viewport.update(1280, 720);
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    let gbuffer = renderer.gbuffer();
    assert_eq!(gbuffer.size(), (1280, 720));
    assert!(gbuffer.generation() > generation);
    for channel in 0..gbuffer.channel_count() {
        let texture = gbuffer.texture(channel).unwrap();
        assert_eq!((texture.width(), texture.height()), (1280, 720));
    }
    assert!(gbuffer.texture(gbuffer.channel_count()).is_none());
    assert_eq!(renderer.rsm().generation(), rsm_generation);
    assert_eq!(renderer.rsm().size(), (1024, 1024));
}

#[test]
fn update_without_resize_keeps_attachments() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(320, 240);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    let generation = renderer.gbuffer().generation();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    assert_eq!(renderer.gbuffer().generation(), generation);
}

#[test]
fn frame_before_update_is_rejected() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(64, 64);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    let output = output_texture(&ctx, 64, 64);
    let view = output.create_view(&wgpu::TextureViewDescriptor::default());
    let err = renderer.render_frame(&ctx, &[], &view).unwrap_err();
    assert!(matches!(err, RenderError::NotUpdated));
}

#[test]
fn too_many_attachments_is_incomplete() {
    let Some(ctx) = gpu() else { return };
    let max = ctx.device.limits().max_color_attachments as usize;
    let desc = RenderTargetDesc {
        label: "overfull".to_string(),
        color_formats: vec![wgpu::TextureFormat::R8Unorm; max + 1],
        include_depth_stencil: false,
        size: RenderTargetSize::Fixed(16, 16),
    };
    let err = RenderTargetSet::new(&ctx, desc, &StaticViewport::new(16, 16))
        .err()
        .expect("set should be rejected");
    assert!(matches!(
        err,
        RenderError::IncompleteFramebuffer {
            reason: Incompleteness::TooManyAttachments { .. },
            ..
        }
    ));
}

#[test]
fn empty_scene_resolves_to_black() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(64, 64);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    let output = output_texture(&ctx, 64, 64);
    let view = output.create_view(&wgpu::TextureViewDescriptor::default());
    renderer.render_frame(&ctx, &[], &view).unwrap();

    let pixels = read_pixels(&ctx, &output, 64, 64);
    assert!(pixels.chunks_exact(4).all(|px| px == [0, 0, 0, 255]));
}

#[test]
fn albedo_visualization_shows_the_default_white_texture() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(64, 64);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    let mut cache = TextureCache::new(&ctx);
    let model = Model::from_meshes(
        &ctx,
        &mut cache,
        renderer.material_layout(),
        "quad",
        &[(facing_quad(), MaterialTextures::default())],
    )
    .unwrap();
    let instances = [Instance::new(Arc::new(model), Mat4::IDENTITY)];

    renderer.params_mut().visualize_buffer = 1;
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    let output = output_texture(&ctx, 64, 64);
    let view = output.create_view(&wgpu::TextureViewDescriptor::default());
    renderer.render_frame(&ctx, &instances, &view).unwrap();
    assert_eq!(renderer.geometry_pipeline_binds(), 1);

    let (width, _) = viewport.viewport_size();
    let pixels = read_pixels(&ctx, &output, 64, 64);
    let center = ((32 * width + 32) * 4) as usize;
    assert_eq!(&pixels[center..center + 4], &[255, 255, 255, 255]);
}

const LIT_SIZE: u32 = 64;

/// Linear output: no fog, no tone mapping, gamma 1, flashlight only.
fn plain_params() -> RendererParams {
    RendererParams {
        ambient: Vec3::splat(0.05),
        light_count: 0,
        fog_density: 0.0,
        tone_mapping: false,
        gamma: 1.0,
        indirect_enabled: false,
        ..RendererParams::default()
    }
}

fn spotlight() -> Flashlight {
    Flashlight {
        camera: Camera::new(Vec3::new(0.0, 0.0, 5.0), 0.0, 0.0),
        color: Vec3::ONE,
        cutoff: 45.0,
        follow_camera: false,
    }
}

/// Looks straight down -Z from beside the flashlight, so the occluder's
/// shadow on the floor stays visible.
fn side_camera() -> Camera {
    Camera::new(Vec3::new(1.5, 0.0, 5.0), 0.0, 0.0)
}

fn quad_model(ctx: &GpuContext, renderer: &DeferredRenderer) -> Arc<Model> {
    let mut cache = TextureCache::new(ctx);
    let model = Model::from_meshes(
        ctx,
        &mut cache,
        renderer.material_layout(),
        "quad",
        &[(facing_quad(), MaterialTextures::default())],
    )
    .unwrap();
    Arc::new(model)
}

/// A 12x12 floor at z = 0 and, optionally, a 1x1 card halfway to the light.
fn floor_scene(model: &Arc<Model>, with_occluder: bool) -> Vec<Instance> {
    let mut instances = vec![Instance::new(
        Arc::clone(model),
        Mat4::from_scale(Vec3::splat(3.0)),
    )];
    if with_occluder {
        instances.push(Instance::new(
            Arc::clone(model),
            Mat4::from_translation(Vec3::new(0.0, 0.0, 2.5)) * Mat4::from_scale(Vec3::splat(0.25)),
        ));
    }
    instances
}

fn render_lit(
    ctx: &GpuContext,
    params: RendererParams,
    with_occluder: bool,
) -> Vec<u8> {
    let viewport = StaticViewport::new(LIT_SIZE, LIT_SIZE);
    let mut renderer = DeferredRenderer::new(ctx, OUTPUT_FORMAT, &viewport).unwrap();
    *renderer.params_mut() = params;
    *renderer.flashlight_mut() = spotlight();
    let model = quad_model(ctx, &renderer);
    let instances = floor_scene(&model, with_occluder);

    renderer.update(ctx, &side_camera(), &viewport).unwrap();
    let output = output_texture(ctx, LIT_SIZE, LIT_SIZE);
    let view = output.create_view(&wgpu::TextureViewDescriptor::default());
    renderer.render_frame(ctx, &instances, &view).unwrap();
    read_pixels(ctx, &output, LIT_SIZE, LIT_SIZE)
}

fn view_projection() -> Mat4 {
    Projection::default().matrix(1.0) * side_camera().view_matrix()
}

/// Pixel covering `world` in the side camera's view.
fn pixel_of(world: Vec3) -> (u32, u32) {
    let ndc = view_projection().project_point3(world);
    let x = ((ndc.x + 1.0) * 0.5 * LIT_SIZE as f32) as u32;
    let y = ((1.0 - ndc.y) * 0.5 * LIT_SIZE as f32) as u32;
    (x, y)
}

/// Where the ray through the center of `pixel` meets the z = 0 floor.
fn floor_point(pixel: (u32, u32)) -> Vec3 {
    let size = LIT_SIZE as f32;
    let ndc = Vec2::new(
        (pixel.0 as f32 + 0.5) / size * 2.0 - 1.0,
        1.0 - (pixel.1 as f32 + 0.5) / size * 2.0,
    );
    let inverse = view_projection().inverse();
    let near = inverse.project_point3(ndc.extend(0.0));
    let far = inverse.project_point3(ndc.extend(1.0));
    near + (far - near) * (near.z / (near.z - far.z))
}

/// CPU resolve of the floor texel seen through `pixel`.
fn expected_floor(params: &RendererParams, pixel: (u32, u32), occluded: bool) -> [u8; 4] {
    let flashlight = spotlight();
    let rsm = if occluded {
        RsmImage::from_fn(1, |_| {
            Some(RsmTexel {
                position: Vec3::ZERO,
                normal: Vec3::Z,
                flux: Vec3::ZERO,
                depth: 0.0,
            })
        })
    } else {
        RsmImage::empty(1)
    };
    let shading = ShadingContext::new(params, side_camera().position(), &[], &flashlight);
    let texel = GBufferTexel::surface(floor_point(pixel), Vec3::Z, Vec3::ONE);
    let color = shading.resolve(&rsm, &texel, Vec2::ZERO);
    color.to_array().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
}

fn pixel_at(pixels: &[u8], pixel: (u32, u32)) -> [u8; 4] {
    let offset = ((pixel.1 * LIT_SIZE + pixel.0) * 4) as usize;
    [pixels[offset], pixels[offset + 1], pixels[offset + 2], pixels[offset + 3]]
}

fn assert_close(actual: [u8; 4], expected: [u8; 4]) {
    let off = actual
        .iter()
        .zip(&expected)
        .any(|(a, e)| a.abs_diff(*e) > 3);
    assert!(!off, "gpu {actual:?} vs cpu {expected:?}");
}

#[test]
fn spotlit_floor_matches_cpu_resolve() {
    let Some(ctx) = gpu() else { return };
    let params = plain_params();
    let pixels = render_lit(&ctx, params.clone(), false);

    for world in [Vec3::ZERO, Vec3::new(3.0, 0.0, 0.0)] {
        let pixel = pixel_of(world);
        let actual = pixel_at(&pixels, pixel);
        assert_close(actual, expected_floor(&params, pixel, false));
        // ambient alone would be 13
        assert!(actual[0] > 60, "{actual:?} at {world}");
    }
}

#[test]
fn occluder_removes_the_spotlight_term_on_gpu() {
    let Some(ctx) = gpu() else { return };
    let params = plain_params();
    let pixels = render_lit(&ctx, params.clone(), true);

    let shadowed = pixel_of(Vec3::ZERO);
    assert_close(pixel_at(&pixels, shadowed), expected_floor(&params, shadowed, true));

    let lit = pixel_of(Vec3::new(3.0, 0.0, 0.0));
    assert_close(pixel_at(&pixels, lit), expected_floor(&params, lit, false));
    assert!(pixel_at(&pixels, lit)[0] > pixel_at(&pixels, shadowed)[0] + 40);
}

#[test]
fn indirect_without_vpls_matches_indirect_disabled() {
    let Some(ctx) = gpu() else { return };
    let disabled = render_lit(
        &ctx,
        RendererParams {
            indirect_enabled: false,
            vpl_count: 64,
            ..plain_params()
        },
        true,
    );
    let no_vpls = render_lit(
        &ctx,
        RendererParams {
            indirect_enabled: true,
            vpl_count: 0,
            ..plain_params()
        },
        true,
    );
    assert!(disabled.chunks_exact(4).any(|px| px[0] > 0));
    assert_eq!(disabled, no_vpls);
}

#[test]
fn mismatched_output_format_fails_the_frame() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(64, 64);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    renderer.update(&ctx, &camera(), &viewport).unwrap();
    let output = output_texture_as(&ctx, 64, 64, wgpu::TextureFormat::Rgba16Float);
    let view = output.create_view(&wgpu::TextureViewDescriptor::default());
    let err = renderer.render_frame(&ctx, &[], &view).unwrap_err();
    assert!(matches!(err, RenderError::Validation { .. }), "{err}");
}

#[test]
fn key_bindings_edit_renderer_tunables() {
    let Some(ctx) = gpu() else { return };
    let viewport = StaticViewport::new(16, 16);
    let mut renderer = DeferredRenderer::new(&ctx, OUTPUT_FORMAT, &viewport).unwrap();
    let mut input = InputState::new();
    input.set_key_down(KeyCode::KeyF);
    input.set_key_down(KeyCode::KeyI);

    let (params, flashlight) = renderer.tunables_mut();
    apply_key_bindings(&input, params, flashlight);
    assert!(renderer.flashlight().follow_camera);
    assert!(!renderer.params().indirect_enabled);
}

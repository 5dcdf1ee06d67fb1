use deferred_rsm::passes::{geometry, lighting, shadow};
use naga::valid::{Capabilities, ValidationFlags, Validator};

fn validate(name: &str, source: &str) -> naga::Module {
    let module = naga::front::wgsl::parse_str(source)
        .unwrap_or_else(|err| panic!("{name} failed to parse:\n{}", err.emit_to_string(source)));
    Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .unwrap_or_else(|err| panic!("{name} failed validation: {err:?}"));
    module
}

fn entry_points(module: &naga::Module) -> Vec<&str> {
    module
        .entry_points
        .iter()
        .map(|entry| entry.name.as_str())
        .collect()
}

#[test]
fn geometry_shader_is_valid_wgsl() {
    let module = validate("geometry", &geometry::shader_source());
    assert_eq!(entry_points(&module), ["vs_main", "fs_main"]);
}

#[test]
fn shadow_shader_is_valid_wgsl() {
    let module = validate("shadow", &shadow::shader_source());
    assert_eq!(entry_points(&module), ["vs_main", "fs_main"]);
}

#[test]
fn lighting_shader_is_valid_wgsl() {
    let module = validate("lighting", &lighting::shader_source());
    assert_eq!(entry_points(&module), ["vs_main", "fs_main"]);
}

#[test]
fn lighting_bindings_follow_the_documented_order() {
    let module = validate("lighting", &lighting::shader_source());
    let mut textures: Vec<(u32, String)> = module
        .global_variables
        .iter()
        .filter_map(|(_, global)| {
            let binding = global.binding.as_ref()?;
            (binding.group == 0).then(|| (binding.binding, global.name.clone().unwrap_or_default()))
        })
        .collect();
    textures.sort();
    let names: Vec<&str> = textures.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(
        names,
        [
            "g_position",
            "g_albedo",
            "g_specular",
            "g_normal",
            "g_translucency",
            "rsm_position",
            "rsm_normal",
            "rsm_flux",
            "rsm_depth",
        ]
    );
}

use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();

    let input_path = PathBuf::from("assets/shaders/");
    println!("cargo:rerun-if-changed={}", input_path.to_string_lossy());
    println!("cargo:rustc-env=FRAME_TRACER_SHADER_DIR={}", out_dir);

    let paths = match fs::read_dir(&input_path) {
        Ok(paths) => paths,
        Err(_) => return,
    };

    // The host backend needs no SPIR-V, so a missing glslc only disables the Vulkan path
    if Command::new("glslc").arg("--version").output().is_err() {
        println!("cargo:warning=glslc not found, compute shaders were not compiled");
        return;
    }

    for entry in paths.flatten() {
        let shader_path = entry.path();
        if !shader_path.is_file() || shader_path.extension().map_or(true, |ext| ext != "comp") {
            continue;
        }
        compile_shader(&shader_path, Path::new(&out_dir));
    }
}

fn compile_shader(shader_path: &Path, out_dir: &Path) {
    let mut output_file_name = shader_path.file_name().unwrap().to_owned();
    output_file_name.push(".spv");
    let output_path = out_dir.join(output_file_name);

    let shader_compile_result = Command::new("glslc")
        .arg("--target-env=vulkan1.3")
        .arg(shader_path)
        .arg("-o")
        .arg(&output_path)
        .status()
        .unwrap();

    if !shader_compile_result.success() {
        panic!(
            "Shader compilation for {} failed: {}",
            shader_path.display(),
            shader_compile_result
        );
    }
}

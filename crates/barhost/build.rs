use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Defaults for module lookup, overridable at runtime through the
    // unprefixed variables (see config.rs).
    let prefix = env::var("BARHOST_PREFIX").unwrap_or_else(|_| "/usr/local".to_string());
    capture_dir("BARHOST_DEFAULT_PLUGINS_DIR", &prefix, "lib/barhost/plugins");
    capture_dir("BARHOST_DEFAULT_BARLIBS_DIR", &prefix, "lib/barhost/barlibs");

    let suffix = env::var("BARHOST_DEFAULT_MODULE_SUFFIX").unwrap_or_else(|_| ".so".to_string());
    println!("cargo:rerun-if-env-changed=BARHOST_DEFAULT_MODULE_SUFFIX");
    println!("cargo:rustc-env=BARHOST_DEFAULT_MODULE_SUFFIX={}", suffix);

    export_lua_symbols();
}

fn capture_dir(var: &str, prefix: &str, relative: &str) {
    println!("cargo:rerun-if-env-changed={}", var);
    println!("cargo:rerun-if-env-changed=BARHOST_PREFIX");
    let dir = env::var(var).unwrap_or_else(|_| format!("{}/{}", prefix.trim_end_matches('/'), relative));
    println!("cargo:rustc-env={}={}", var, dir);
}

/// Plugins and barlibs are built without their own Lua; the host binary must
/// export the vendored Lua API so `dlopen` can resolve it.
fn export_lua_symbols() {
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "macos" {
        println!("cargo:rustc-link-arg-bins=-Wl,-export_dynamic");
    } else {
        println!("cargo:rustc-link-arg-bins=-rdynamic");
    }
}

fn main() {
    #[cfg(not(target_os = "linux"))]
    {
        println!("cargo:warning=winmirror only supports Linux with an X11 session");
    }

    // libxcb is loaded at runtime (x11rb dl-libxcb), the Vulkan loader by ash
    println!("cargo:rerun-if-env-changed=PKG_CONFIG_PATH");
    println!("cargo:rerun-if-changed=build.rs");
}

#[cfg(windows)]
fn main() -> std::io::Result<()>{
    let mut res = winres::WindowsResource::new();
    res.set("InternalName", "pynet.dll");
    res.compile()?;
    Ok(())
}

#[cfg(not(windows))]
fn main() {
}

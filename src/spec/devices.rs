use crate::{
    errors::SpecError,
    request::DeviceRequest,
    spec::{DeviceRule, LinuxDevice},
};
use std::{
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::Path,
};

/// Look up a host device node and describe it for the runtime
///
/// The returned rule allows the container's cgroup to use the device with
/// the requested permissions (`rwm` when none are given).
pub fn host_device(request: &DeviceRequest) -> Result<(LinuxDevice, DeviceRule), SpecError> {
    let host_path = Path::new(&request.host_path);
    let meta = fs::metadata(host_path).map_err(|err| SpecError::io(host_path, err))?;
    let file_type = meta.file_type();
    let kind = if file_type.is_char_device() {
        "c"
    } else if file_type.is_block_device() {
        "b"
    } else {
        return Err(SpecError::NotADevice(host_path.to_path_buf()));
    };

    let rdev = meta.rdev();
    #[allow(unused_unsafe)]
    let (major, minor) = unsafe { (libc::major(rdev) as i64, libc::minor(rdev) as i64) };
    let container_path = if request.container_path.is_empty() {
        request.host_path.clone()
    } else {
        request.container_path.clone()
    };
    let access = if request.permissions.is_empty() {
        "rwm".to_string()
    } else {
        request.permissions.clone()
    };

    Ok((
        LinuxDevice {
            path: container_path,
            kind: kind.to_string(),
            major,
            minor,
            file_mode: Some(meta.mode() & 0o777),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        },
        DeviceRule {
            allow: true,
            kind: Some(kind.to_string()),
            major: Some(major),
            minor: Some(minor),
            access: Some(access),
        },
    ))
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use test_case::test_case;

use crate::error::Error;
use crate::{Device, DeviceId, DeviceRegistry, FamilyCaps, HostAllocator, canonicalize};

fn host(id: &DeviceId, caps: FamilyCaps) -> crate::Result<Device> {
    Ok(Device::new(id.to_string(), id.family.clone(), Box::new(HostAllocator::new(id.to_string())), caps, None))
}

fn registry() -> DeviceRegistry {
    let multi = FamilyCaps { multi_instance: true, ..Default::default() };
    let disk = FamilyCaps { pass_through: true, multi_instance: true, ..Default::default() };
    DeviceRegistry::builder()
        .family("CPU", FamilyCaps::default(), |id| host(id, FamilyCaps::default()))
        .family("GPU", multi, move |id| host(id, multi))
        .family("DISK", disk, move |id| host(id, disk))
        .build()
}

#[test_case("gpu:0", "GPU")]
#[test_case("gpu:1", "GPU:1")]
#[test_case(" cpu ", "CPU")]
#[test_case("Disk:12", "DISK:12")]
fn test_canonicalize(input: &str, expected: &str) {
    assert_eq!(canonicalize(input).unwrap(), expected);
}

#[test_case("" ; "empty")]
#[test_case(":1" ; "no family")]
#[test_case("GPU:x" ; "non numeric index")]
#[test_case("GPU:-1" ; "negative index")]
fn test_parse_rejects(input: &str) {
    assert!(matches!(DeviceId::parse(input), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_resolve_caches_by_canonical_name() {
    let reg = registry();
    let a = reg.resolve("gpu").unwrap();
    let b = reg.resolve("GPU:0").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.name(), "GPU");
    let c = reg.resolve("gpu:1").unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(reg.opened().len(), 2);
}

#[test]
fn test_single_instance_family() {
    let reg = registry();
    assert!(matches!(reg.resolve("CPU:1"), Err(Error::InvalidDevice { .. })));
    assert!(matches!(reg.resolve("TPU"), Err(Error::UnknownFamily { .. })));
}

#[test]
fn test_compute_devices_belong_to_owner_thread() {
    let reg = Arc::new(registry());
    let remote = Arc::clone(&reg);
    let (cpu, disk) = std::thread::spawn(move || (remote.resolve("CPU").map(|_| ()), remote.resolve("DISK").map(|_| ())))
        .join()
        .unwrap();
    assert!(matches!(cpu, Err(Error::WrongContext { .. })));
    assert!(disk.is_ok());
    assert!(reg.resolve("CPU").is_ok());
}

#[test]
fn test_default_device_probes_priority_once() {
    let probes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&probes);
    let reg = DeviceRegistry::builder()
        .family("CUDA", FamilyCaps::default(), move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidDevice { device: id.to_string() })
        })
        .family("CPU", FamilyCaps::default(), |id| host(id, FamilyCaps::default()))
        .build();
    assert_eq!(reg.default_device().unwrap().name(), "CPU");
    assert_eq!(reg.default_device().unwrap().name(), "CPU");
    assert_eq!(probes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_default_device_preferred_and_none_usable() {
    let reg = DeviceRegistry::builder()
        .family("CPU", FamilyCaps::default(), |id| host(id, FamilyCaps::default()))
        .family("EMU", FamilyCaps::default(), |id| host(id, FamilyCaps::default()))
        .preferred(Some("emu".to_string()))
        .build();
    assert_eq!(reg.default_device().unwrap().name(), "EMU");

    let empty = DeviceRegistry::builder().build();
    assert!(matches!(empty.default_device(), Err(Error::NoUsableDevice { .. })));
}

use kiln_dtype::DType;

use crate::test::host_device;
use crate::{Buffer, BufferArena, BufferOptions};

#[test]
fn test_register_is_idempotent_for_live_buffers() {
    let dev = host_device("CPU");
    let mut arena = BufferArena::new();
    let a = Buffer::new(dev.clone(), 4, DType::Float32, BufferOptions::default());
    let b = Buffer::new(dev, 4, DType::Float32, BufferOptions::default());
    let id_a = arena.register(&a);
    assert_eq!(arena.register(&a.clone()), id_a);
    assert_ne!(arena.register(&b), id_a);
    assert_eq!(arena.len(), 2);
}

#[test]
fn test_get_does_not_pin() {
    let dev = host_device("CPU");
    let mut arena = BufferArena::new();
    let buffer = Buffer::new(dev, 8, DType::Int32, BufferOptions { nolru: true, ..Default::default() });
    let id = arena.register(&buffer);
    assert!(arena.get(id).unwrap().ptr_eq(&buffer));

    drop(buffer);
    assert!(arena.get(id).is_none());
    let desc = arena.descriptor(id).unwrap();
    assert_eq!((desc.size, desc.dtype.clone()), (8, DType::Int32));
    assert!(desc.options.nolru);

    let fresh = desc.instantiate();
    assert_eq!(fresh.nbytes(), 32);
    assert!(!fresh.is_allocated());
}

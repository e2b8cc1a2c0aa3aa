mod common;

use veldt::generation::GenerationKind;
use veldt::util::test_util::with_serial_lock;
use veldt::ObjectKind;

#[test]
fn objects_roundtrip_through_the_heap() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        let a = mutator.alloc(2, 8, ObjectKind::Regular).unwrap();
        let b = mutator.alloc(0, 4, ObjectKind::Regular).unwrap();
        assert_ne!(a, b);

        unsafe { mutator.payload_addr(a).store::<usize>(0xdead) };
        mutator.store_ref(a, 0, Some(b));
        mutator.store_ref(a, 1, None);

        assert_eq!(mutator.load_ref(a, 0), Some(b));
        assert_eq!(mutator.load_ref(a, 1), None);
        assert_eq!(unsafe { mutator.payload_addr(a).load::<usize>() }, 0xdead);

        drop(mutator);
        heap.shutdown();
    });
}

#[test]
fn allocation_is_accounted_to_young() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();
        let young = heap.generation(GenerationKind::Young);

        let before = young.used();
        let _ = common::alloc_chain(&mutator, 100, 16);
        let after = young.used();
        assert!(after > before, "allocation must grow young used");

        // The heap-wide invariant: used + waste <= affiliated * region_size
        // <= capacity.
        for kind in [GenerationKind::Young, GenerationKind::Old] {
            let generation = heap.generation(kind);
            assert!(
                generation.used() + generation.humongous_waste()
                    <= generation.affiliated_region_count() * common::REGION
            );
            assert!(
                generation.affiliated_region_count() * common::REGION
                    <= generation.max_capacity()
            );
        }
        assert_eq!(
            heap.global_generation().used(),
            heap.generation(GenerationKind::Young).used()
                + heap.generation(GenerationKind::Old).used()
        );

        drop(mutator);
        heap.shutdown();
    });
}

#[test]
fn humongous_objects_span_contiguous_regions() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let mutator = heap.attach_mutator();

        // ~2.5 regions of payload.
        let payload_words = common::REGION / 8 * 5 / 2;
        let obj = mutator.alloc(0, payload_words, ObjectKind::Regular).unwrap();

        let start = heap.region_of(obj.to_address());
        assert!(start.is_humongous_start());
        assert!(heap.region(start.index() + 1).is_humongous_cont());
        assert!(heap.region(start.index() + 2).is_humongous_cont());
        assert_eq!(
            heap.region(start.index() + 2).humongous_start_index(),
            start.index()
        );
        assert!(heap.young_generation().humongous_waste() > 0);

        unsafe { mutator.payload_addr(obj).store::<usize>(42) };
        assert_eq!(unsafe { mutator.payload_addr(obj).load::<usize>() }, 42);

        drop(mutator);
        heap.shutdown();
    });
}

#[test]
fn capacity_transfer_roundtrip_is_identity() {
    with_serial_lock(|| {
        let heap = common::heap("");
        let young_before = heap.young_generation().max_capacity();
        let old_before = heap.old_generation().max_capacity();

        assert!(heap.sizer().transfer_to_old(&heap, 3));
        assert!(heap.sizer().transfer_to_young(&heap, 3));

        assert_eq!(heap.young_generation().max_capacity(), young_before);
        assert_eq!(heap.old_generation().max_capacity(), old_before);
        heap.shutdown();
    });
}

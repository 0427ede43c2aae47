use credence_harness::config::ConfigError;
use credence_harness::templates::TemplateCatalog;
use credence_harness::worklist::build_worklist;

#[test]
fn worklist_is_deterministic() {
    let catalog = TemplateCatalog::builtin();
    let first = build_worklist(7, 3, &catalog).unwrap();
    let second = build_worklist(7, 3, &catalog).unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.sequence, b.sequence);
        assert_eq!(a.slot, b.slot);
        assert_eq!(a.replicate, b.replicate);
        assert_eq!(a.template_ordinal, b.template_ordinal);
        assert_eq!(a.template_hash, b.template_hash);
    }
}

#[test]
fn seven_slots_over_five_templates_wrap_around() {
    let catalog = TemplateCatalog::builtin().with_cap(5).unwrap();
    let units = build_worklist(7, 1, &catalog).unwrap();

    let ordinals: Vec<usize> = units.iter().map(|u| u.template_ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2, 3, 4, 0, 1]);

    // Wrapped slots reuse the exact template identity, not just the ordinal.
    assert_eq!(units[5].template_hash, units[0].template_hash);
    assert_eq!(units[6].template_hash, units[1].template_hash);
}

#[test]
fn sequence_indices_are_slot_major_replicate_minor() {
    let catalog = TemplateCatalog::builtin();
    let units = build_worklist(4, 3, &catalog).unwrap();

    assert_eq!(units.len(), 12);
    for (i, unit) in units.iter().enumerate() {
        assert_eq!(unit.sequence, i);
        assert_eq!(unit.sequence, unit.slot * 3 + unit.replicate);
    }
}

#[test]
fn invalid_plans_fail_before_any_work() {
    let catalog = TemplateCatalog::builtin();
    assert!(matches!(
        build_worklist(0, 3, &catalog),
        Err(ConfigError::InvalidSlots)
    ));
    assert!(matches!(
        build_worklist(3, 0, &catalog),
        Err(ConfigError::InvalidReplicates)
    ));
    assert!(matches!(
        TemplateCatalog::builtin().with_cap(0),
        Err(ConfigError::EmptyCatalog)
    ));
}

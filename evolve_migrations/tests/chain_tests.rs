//! End-to-end runs of the migration chain over the in-memory log store.

use evolve_core::fields;
use evolve_core::prelude::*;
use evolve_mem::InMemoryLogStore;
use evolve_migrations::{LATEST, registry, registry_up_to};
use serde_json::{Value, json};

fn fqid(collection: &str, id: u64) -> Fqid {
    Fqid::new(collection, id).unwrap()
}

fn list_update(fqid: Fqid, add: ListFields, remove: ListFields) -> Event {
    Event::ListUpdate {
        fqid,
        add: (!add.is_empty()).then_some(add),
        remove: (!remove.is_empty()).then_some(remove),
    }
}

/// One position per entry, numbered from 1, at the baseline index.
fn log(positions: Vec<Vec<Event>>) -> Vec<Position> {
    positions
        .into_iter()
        .enumerate()
        .map(|(i, events)| Position::new(i as u64 + 1, BASELINE_MIGRATION_INDEX, events))
        .collect()
}

async fn finalize(positions: Vec<Position>, registry: MigrationRegistry) -> Vec<Position> {
    let store = InMemoryLogStore::with_positions(positions);
    let engine = MigrationEngine::new(store.clone(), registry).with_config(EngineConfig {
        verify_projection: true,
        ..EngineConfig::default()
    });
    let outcome = engine.finalize().await.unwrap();
    assert!(outcome.finalized);
    store.positions().await
}

/// The projection after the first `upto` positions.
fn at(positions: &[Position], upto: usize) -> ModelStore {
    ModelStore::replay(&positions[..upto]).unwrap()
}

fn model(store: &ModelStore, collection: &str, id: u64) -> Model {
    store.get(&fqid(collection, id)).cloned().unwrap()
}

#[tokio::test]
async fn removed_field_is_gone_through_the_whole_lifecycle() {
    let f = fqid("motion_state", 1);
    let live = finalize(
        log(vec![
            vec![Event::create(f.clone(), fields! {"a" => 1, "dont_set_identifier" => false})],
            vec![Event::update(f.clone(), fields! {"a" => 2, "dont_set_identifier" => true})],
            vec![Event::delete(f.clone())],
            vec![Event::restore(f.clone())],
        ]),
        registry_up_to(2).unwrap(),
    )
    .await;

    let expected = [
        (fields! {"a" => 1}, false),
        (fields! {"a" => 2}, false),
        (fields! {"a" => 2}, true),
        (fields! {"a" => 2}, false),
    ];
    for (upto, (fields, deleted)) in expected.into_iter().enumerate() {
        let m = model(&at(&live, upto + 1), "motion_state", 1);
        assert_eq!(m.fields, fields, "position {}", upto + 1);
        assert_eq!(m.meta_deleted, deleted, "position {}", upto + 1);
        assert_eq!(m.meta_position, upto as u64 + 1);
    }
    assert!(live.iter().all(|p| p.migration_index == 2));
}

#[tokio::test]
async fn topics_are_numbered_per_meeting() {
    let topic =
        |id: u64, meeting: u64| Event::create(fqid("topic", id), fields! {"meeting_id" => meeting});
    let live = finalize(
        log(vec![
            vec![
                Event::create(fqid("meeting", 1), fields! {}),
                Event::create(fqid("meeting", 2), fields! {}),
            ],
            vec![topic(1, 1), topic(2, 1)],
            vec![topic(3, 2), topic(4, 2)],
        ]),
        registry_up_to(3).unwrap(),
    )
    .await;

    let models = at(&live, live.len());
    let numbers: Vec<_> = (1..=4)
        .map(|id| model(&models, "topic", id).get_i64("sequential_number"))
        .collect();
    assert_eq!(numbers, vec![Some(1), Some(2), Some(1), Some(2)]);
}

#[tokio::test]
async fn template_meeting_id_becomes_a_list() {
    let live = finalize(
        log(vec![
            vec![Event::create(
                fqid("committee", 1),
                fields! {"id" => 1, "template_meeting_id" => 1},
            )],
            vec![Event::create(
                fqid("committee", 2),
                fields! {"id" => 2, "template_meeting_id" => null},
            )],
        ]),
        registry_up_to(4).unwrap(),
    )
    .await;

    assert_eq!(
        live[0].events,
        vec![Event::create(
            fqid("committee", 1),
            fields! {"id" => 1, "template_meeting_ids" => [1]}
        )]
    );
    assert_eq!(
        live[1].events,
        vec![Event::create(fqid("committee", 2), fields! {"id" => 2})]
    );
}

#[tokio::test]
async fn meeting_creates_get_export_defaults() {
    let live = finalize(
        log(vec![vec![Event::create(
            fqid("meeting", 1),
            fields! {"export_csv_separator" => ","},
        )]]),
        registry_up_to(5).unwrap(),
    )
    .await;

    let meeting = model(&at(&live, 1), "meeting", 1);
    assert_eq!(meeting.get_str("export_csv_encoding"), Some("utf-8"));
    assert_eq!(meeting.get_str("export_csv_separator"), Some(","));
    assert_eq!(meeting.get("users_enable_vote_delegations"), Some(&json!(true)));
}

#[tokio::test]
async fn archived_meetings_are_listed_on_the_organization() {
    let org = fqid("organization", 1);
    let meeting = fqid("meeting", 1);
    let active = |add: bool| {
        let list = fields! {"active_meeting_ids" => [1]};
        if add {
            list_update(org.clone(), list, ListFields::new())
        } else {
            list_update(org.clone(), ListFields::new(), list)
        }
    };
    let live = finalize(
        log(vec![
            vec![
                Event::create(org.clone(), fields! {"active_meeting_ids" => [1]}),
                Event::create(meeting.clone(), fields! {"is_active_in_organization_id" => 1}),
            ],
            vec![
                Event::update(meeting.clone(), fields! {"is_active_in_organization_id" => 0}),
                active(false),
            ],
            vec![
                Event::update(meeting.clone(), fields! {"is_active_in_organization_id" => 1}),
                active(true),
            ],
        ]),
        registry_up_to(6).unwrap(),
    )
    .await;

    let first = at(&live, 1);
    assert!(model(&first, "organization", 1).get("archived_meeting_ids").is_none());

    let archived = at(&live, 2);
    assert_eq!(
        model(&archived, "organization", 1).get("archived_meeting_ids"),
        Some(&json!([1]))
    );
    assert_eq!(
        model(&archived, "meeting", 1).get_i64("is_archived_in_organization_id"),
        Some(1)
    );

    let reactivated = at(&live, 3);
    let organization = model(&reactivated, "organization", 1);
    assert_eq!(organization.get("archived_meeting_ids"), Some(&json!([])));
    assert_eq!(organization.get("active_meeting_ids"), Some(&json!([1])));
    assert!(
        model(&reactivated, "meeting", 1)
            .get("is_archived_in_organization_id")
            .is_none()
    );
}

#[tokio::test]
async fn archived_meetings_wait_for_the_organization() {
    let org = fqid("organization", 1);
    let live = finalize(
        log(vec![
            vec![Event::create(fqid("meeting", 1), fields! {"name" => "early"})],
            vec![Event::create(fqid("meeting", 2), fields! {"is_active_in_organization_id" => 1})],
            vec![Event::create(org.clone(), fields! {"name" => "org"})],
            vec![Event::update(org.clone(), fields! {"name" => "renamed"})],
        ]),
        registry_up_to(6).unwrap(),
    )
    .await;

    assert!(at(&live, 2).get(&org).is_none());
    assert_eq!(
        live[2].events.last(),
        Some(&list_update(
            org.clone(),
            fields! {"archived_meeting_ids" => [1]},
            ListFields::new()
        ))
    );
    assert_eq!(
        model(&at(&live, 3), "organization", 1).get("archived_meeting_ids"),
        Some(&json!([1]))
    );
    assert_eq!(live[3].events.len(), 1);
}

#[tokio::test]
async fn meeting_created_without_active_flag_is_archived_in_the_same_position() {
    let live = finalize(
        log(vec![vec![
            Event::create(fqid("meeting", 3), fields! {"name" => "old"}),
            Event::create(fqid("organization", 1), fields! {"name" => "org"}),
        ]]),
        registry_up_to(6).unwrap(),
    )
    .await;

    assert_eq!(live[0].events.len(), 3, "the list update is appended");
    let models = at(&live, 1);
    assert_eq!(
        model(&models, "organization", 1).get("archived_meeting_ids"),
        Some(&json!([3]))
    );
}

#[tokio::test]
async fn idp_id_follows_username_and_saml_id() {
    let user = fqid("user", 1);
    let live = finalize(
        log(vec![
            vec![Event::create(user.clone(), fields! {"username" => "ann"})],
            vec![Event::update(user.clone(), fields! {"saml_id" => "x1"})],
            vec![Event::delete_fields(user.clone(), ["saml_id"])],
        ]),
        registry_up_to(7).unwrap(),
    )
    .await;

    let idp = |upto| model(&at(&live, upto), "user", 1).get("idp_id").cloned();
    assert_eq!(idp(1), Some(json!("ann")));
    assert_eq!(idp(2), Some(json!("ann_x1")));
    assert_eq!(idp(3), Some(json!("ann")));
}

#[tokio::test]
async fn update_repeating_the_current_value_is_dropped() {
    let dummy = fqid("dummy", 1);
    let live = finalize(
        log(vec![
            vec![Event::create(dummy.clone(), fields! {"f1" => 1})],
            vec![Event::update(dummy.clone(), fields! {"f1" => 2})],
            vec![Event::update(dummy.clone(), fields! {"f1" => 2})],
        ]),
        registry_up_to(8).unwrap(),
    )
    .await;

    assert_eq!(live.len(), 3, "positions are never removed");
    assert!(live[2].events.is_empty());
    assert_eq!(model(&at(&live, 2), "dummy", 1), model(&at(&live, 3), "dummy", 1));
}

#[tokio::test]
async fn redundant_parts_of_events_are_pruned() {
    let dummy = fqid("dummy", 1);
    let live = finalize(
        log(vec![
            vec![Event::create(dummy.clone(), fields! {"f1" => 1, "l" => [1, 2]})],
            vec![
                Event::update(dummy.clone(), fields! {"f1" => 1, "f2" => 2, "f3" => null}),
                Event::delete_fields(dummy.clone(), ["f2", "f4"]),
                list_update(dummy.clone(), fields! {"l" => [2, 3]}, fields! {"l" => [4]}),
            ],
        ]),
        registry_up_to(8).unwrap(),
    )
    .await;

    assert_eq!(
        live[1].events,
        vec![
            Event::update(dummy.clone(), fields! {"f2" => 2}),
            Event::delete_fields(dummy.clone(), ["f2"]),
            list_update(dummy.clone(), fields! {"l" => [3]}, ListFields::new()),
        ]
    );
}

#[tokio::test]
async fn mediafile_access_is_inherited_down_the_tree() {
    let file = |id: u64, fields: Fields| Event::create(fqid("mediafile", id), fields);
    let live = finalize(
        log(vec![vec![
            file(1, fields! {"is_directory" => true, "access_group_ids" => [1, 2]}),
            file(2, fields! {"parent_id" => 1, "access_group_ids" => [2, 3]}),
            file(3, fields! {"parent_id" => 1}),
            file(4, fields! {"is_directory" => true}),
            file(5, fields! {"parent_id" => 4}),
        ]]),
        registry_up_to(9).unwrap(),
    )
    .await;

    assert_eq!(live.len(), 2);
    assert_eq!(
        live[1].information,
        Some(json!({"migration": "mediafile_inherited_access_groups"}))
    );
    let models = at(&live, 2);
    let access = |id| {
        let m = model(&models, "mediafile", id);
        (m.get("is_public").cloned(), m.get("inherited_access_group_ids").cloned())
    };
    assert_eq!(access(1), (Some(json!(false)), Some(json!([1, 2]))));
    assert_eq!(access(2), (Some(json!(false)), Some(json!([2]))));
    assert_eq!(access(3), (Some(json!(false)), Some(json!([1, 2]))));
    assert_eq!(access(4), (Some(json!(true)), Some(json!([]))));
    assert_eq!(access(5), (Some(json!(true)), Some(json!([]))));
}

#[tokio::test]
async fn mediafile_under_a_file_fails_the_run() {
    let positions = log(vec![vec![
        Event::create(fqid("mediafile", 1), fields! {"is_directory" => false}),
        Event::create(fqid("mediafile", 2), fields! {"parent_id" => 1}),
    ]]);
    let store = InMemoryLogStore::with_positions(positions.clone());
    let err = MigrationEngine::new(store.clone(), registry_up_to(9).unwrap())
        .finalize()
        .await
        .unwrap_err();

    match &err {
        EngineError::Migration {
            target_mi: 9,
            source: MigrationError::AssertionFailure { fqid: offender, .. },
            ..
        } => assert_eq!(offender, &fqid("mediafile", 1)),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(store.positions().await, positions);
    assert_eq!(store.staging_phase().await.unwrap(), StagingPhase::Idle);
}

#[tokio::test]
async fn preview_skips_the_gender_migration() {
    let positions = log(vec![vec![Event::create(
        fqid("user", 1),
        fields! {"gender" => "female"},
    )]]);
    let store = InMemoryLogStore::with_positions(positions.clone());
    let outcome = MigrationEngine::new(store.clone(), registry().unwrap())
        .preview()
        .await
        .unwrap();

    assert_eq!(outcome.to_mi, Some(LATEST));
    assert_eq!(outcome.positions.len(), 1);
    assert_eq!(outcome.positions[0].events, positions[0].events);
    assert_eq!(outcome.positions[0].migration_index, LATEST);
    assert_eq!(store.positions().await, positions, "preview writes nothing");
}

#[tokio::test]
async fn genders_become_models() {
    let user =
        |id: u64, gender: Value| Event::create(fqid("user", id), fields! {"gender" => gender});
    let live = finalize(
        log(vec![
            vec![Event::create(fqid("organization", 1), fields! {"name" => "org"})],
            vec![
                user(1, json!("female")),
                user(2, json!("male")),
                user(3, json!("female")),
                user(4, Value::Null),
            ],
        ]),
        registry().unwrap(),
    )
    .await;

    assert_eq!(live.len(), 3);
    assert!(live.iter().all(|p| p.migration_index == LATEST));
    let models = at(&live, 3);
    let female = model(&models, "gender", 1);
    assert_eq!(female.get_str("name"), Some("female"));
    assert_eq!(female.get("user_ids"), Some(&json!([1, 3])));
    assert_eq!(model(&models, "gender", 2).get_str("name"), Some("male"));
    assert_eq!(
        model(&models, "organization", 1).get("gender_ids"),
        Some(&json!([1, 2]))
    );
    let first = model(&models, "user", 1);
    assert_eq!(first.get_i64("gender_id"), Some(1));
    assert!(first.get("gender").is_none());
    assert!(model(&models, "user", 4).get("gender_id").is_none());
}

#[tokio::test]
async fn new_genders_skip_deleted_ids() {
    let live = finalize(
        log(vec![
            vec![
                Event::create(fqid("organization", 1), fields! {"name" => "org"}),
                Event::create(fqid("gender", 1), fields! {"name" => "female"}),
                Event::create(fqid("gender", 3), fields! {"name" => "retired"}),
            ],
            vec![Event::delete(fqid("gender", 3))],
            vec![
                Event::create(fqid("user", 1), fields! {"gender" => "female"}),
                Event::create(fqid("user", 2), fields! {"gender" => "diverse"}),
                Event::create(fqid("user", 3), fields! {"gender" => "male"}),
            ],
        ]),
        registry().unwrap(),
    )
    .await;

    let models = at(&live, live.len());
    let (retired, deleted) = models
        .get(&fqid("gender", 3))
        .map(|m| (m.get_str("name").map(str::to_string), m.meta_deleted))
        .unwrap();
    assert_eq!(retired.as_deref(), Some("retired"));
    assert!(deleted);
    assert_eq!(model(&models, "gender", 4).get_str("name"), Some("diverse"));
    assert_eq!(model(&models, "gender", 5).get_str("name"), Some("male"));
    assert!(models.get(&fqid("gender", 2)).is_none());
    assert_eq!(model(&models, "user", 2).get_i64("gender_id"), Some(4));
    assert_eq!(model(&models, "user", 3).get_i64("gender_id"), Some(5));
    assert_eq!(model(&models, "user", 1).get_i64("gender_id"), Some(1));
}

#[tokio::test]
async fn whole_chain_is_deterministic_and_reaches_the_latest_index() {
    let positions = log(vec![
        vec![
            Event::create(fqid("organization", 1), fields! {"name" => "org"}),
            Event::create(fqid("meeting", 1), fields! {"is_active_in_organization_id" => 1}),
            Event::create(fqid("motion_state", 1), fields! {"dont_set_identifier" => true}),
        ],
        vec![
            Event::create(fqid("topic", 1), fields! {"meeting_id" => 1}),
            Event::create(fqid("user", 1), fields! {"username" => "u", "gender" => "x"}),
            Event::create(fqid("committee", 1), fields! {"template_meeting_id" => 1}),
        ],
        vec![Event::update(fqid("meeting", 1), fields! {"is_active_in_organization_id" => null})],
        vec![Event::create(fqid("mediafile", 1), fields! {"is_directory" => true})],
    ]);

    let first = finalize(positions.clone(), registry().unwrap()).await;
    let second = finalize(positions, registry().unwrap()).await;
    assert_eq!(first, second);
    assert!(first.iter().all(|p| p.migration_index == LATEST));
    let numbers: Vec<_> = first.iter().map(|p| p.position).collect();
    assert_eq!(numbers, (1..=first.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn untouched_events_pass_through_unchanged() {
    let positions = log(vec![
        vec![Event::create(fqid("dummy", 1), fields! {"a" => 1, "l" => [1]})],
        vec![Event::update(fqid("dummy", 1), fields! {"a" => 2})],
        vec![list_update(
            fqid("dummy", 1),
            fields! {"l" => [2]},
            ListFields::new(),
        )],
        vec![Event::delete(fqid("dummy", 1))],
    ]);
    let live = finalize(positions.clone(), registry_up_to(8).unwrap()).await;
    for (before, after) in positions.iter().zip(&live) {
        assert_eq!(before.events, after.events);
        assert_eq!(after.migration_index, 8);
    }
}

fn remove_twice() -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    for target in [2, 3] {
        registry
            .register(move || {
                Migration::event(RemoveFieldsMigration::single(target, "remove_f", "dummy", "f"))
            })
            .unwrap();
    }
    registry
}

#[tokio::test]
async fn removing_a_field_twice_equals_removing_it_once() {
    let dummy = fqid("dummy", 1);
    let positions = log(vec![
        vec![Event::create(dummy.clone(), fields! {"f" => 1, "g" => 1})],
        vec![Event::update(dummy.clone(), fields! {"f" => 2})],
        vec![Event::delete_fields(dummy.clone(), ["f", "g"])],
    ]);
    let mut once = MigrationRegistry::new();
    once.register(|| Migration::event(RemoveFieldsMigration::single(2, "remove_f", "dummy", "f")))
        .unwrap();

    let once = finalize(positions.clone(), once).await;
    let twice = finalize(positions, remove_twice()).await;
    let events = |log: &[Position]| log.iter().map(|p| p.events.clone()).collect::<Vec<_>>();
    assert_eq!(events(&once), events(&twice));
    assert!(twice[1].events.is_empty());
}

#[tokio::test]
async fn renaming_there_and_back_preserves_the_data() {
    let thing = fqid("thing", 1);
    let positions = log(vec![
        vec![Event::create(thing.clone(), fields! {"a" => 1, "x" => 0})],
        vec![Event::update(thing.clone(), fields! {"a" => 2})],
        vec![list_update(thing.clone(), fields! {"a_list" => [1]}, ListFields::new())],
        vec![Event::delete_fields(thing.clone(), ["x"])],
    ]);
    let mut registry = MigrationRegistry::new();
    registry
        .register(|| Migration::event(RenameFieldMigration::new(2, "there", "thing", "a", "b")))
        .unwrap();
    registry
        .register(|| Migration::event(RenameFieldMigration::new(3, "back", "thing", "b", "a")))
        .unwrap();

    let live = finalize(positions.clone(), registry).await;
    for upto in 1..=positions.len() {
        assert_eq!(
            model(&at(&live, upto), "thing", 1),
            model(&at(&positions, upto), "thing", 1)
        );
    }
}

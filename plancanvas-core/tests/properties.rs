//! Property-based tests for reconciliation invariants.

use plancanvas_core::{
    AspectPayload, CanvasAspect, CanvasSession, Mutation, RemoteChange, SyncEvent,
};
use proptest::prelude::*;
use uuid::Uuid;

fn note(label: &str) -> AspectPayload {
    AspectPayload::note(0.0, 0.0, label)
}

fn ack_for(mutation: &Mutation, canonical_id: String) -> SyncEvent {
    SyncEvent::Ack {
        correlation_id: mutation.correlation_id.clone(),
        seq: mutation.seq,
        aspect: Some(
            CanvasAspect::canonical(canonical_id, 1, note("P"))
                .with_origin(mutation.correlation_id.clone()),
        ),
    }
}

proptest! {
    #[test]
    fn test_acked_creates_leave_only_canonical_ids(
        count in 1usize..24,
        order in any::<u64>(),
        duplicate in any::<bool>(),
    ) {
        let mut session = CanvasSession::new(Uuid::new_v4());
        let mut acks: Vec<SyncEvent> = (0..count)
            .map(|i| {
                let (_, m) = session.create(note("P"));
                ack_for(&m, format!("c-{i}"))
            })
            .collect();

        // Deterministic shuffle from the generated seed.
        let len = acks.len();
        for i in (1..len).rev() {
            let j = (order.rotate_left(i as u32) as usize) % (i + 1);
            acks.swap(i, j);
        }
        if duplicate {
            let again = acks.clone();
            acks.extend(again);
        }
        for ack in acks {
            session.apply(ack);
        }

        prop_assert!(session.pending().is_empty());
        prop_assert_eq!(session.store().len(), count);
        prop_assert!(session.store().ids().iter().all(|id| !id.is_tentative()));
    }

    #[test]
    fn test_stale_remote_change_is_ignored(stored in 1u64..1_000, offset in 0u64..1_000) {
        let incoming = 1 + offset % stored;
        let mut session = CanvasSession::new(Uuid::new_v4());
        session.apply(SyncEvent::Snapshot(vec![CanvasAspect::canonical("c-1", stored, note("kept"))]));
        let before = session.store().get_all();

        let out = session.apply(SyncEvent::RemoteChange(RemoteChange::Upsert(
            CanvasAspect::canonical("c-1", incoming, note("stale")),
        )));

        prop_assert!(!out.changed);
        prop_assert_eq!(session.store().get_all(), before);
    }

    #[test]
    fn test_pending_edit_survives_any_remote_change(
        revisions in proptest::collection::vec(1u64..50, 1..16),
    ) {
        let mut session = CanvasSession::new(Uuid::new_v4());
        session.apply(SyncEvent::Snapshot(vec![CanvasAspect::canonical("c-1", 1, note("base"))]));
        session.update(&"c-1".into(), note("mine")).unwrap();

        for revision in revisions {
            session.apply(SyncEvent::RemoteChange(RemoteChange::Upsert(
                CanvasAspect::canonical("c-1", revision, note("theirs")),
            )));
            let shown = session.store().get_by_id(&"c-1".into()).unwrap();
            prop_assert_eq!(shown.payload.label.as_str(), "mine");
            prop_assert!(session.pending().contains(&"c-1".into()));
        }
    }

    #[test]
    fn test_resnapshot_republishes_every_pending_entry(
        creates in 0usize..12,
        updates in 0usize..8,
        coalesced in 0usize..8,
    ) {
        let mut session = CanvasSession::new(Uuid::new_v4());
        let canonical: Vec<_> = (0..8)
            .map(|i| CanvasAspect::canonical(format!("c-{i}"), 1, note("x")))
            .collect();
        session.apply(SyncEvent::Snapshot(canonical.clone()));

        for _ in 0..creates {
            session.create(note("offline"));
        }
        for i in 0..updates {
            session.update(&format!("c-{i}").into(), note("edit")).unwrap();
        }
        // Further edits to already pending ids add no new entries.
        for i in 0..coalesced.min(updates) {
            session.update(&format!("c-{i}").into(), note("edit again")).unwrap();
        }

        let pending = session.pending().len();
        prop_assert_eq!(pending, creates + updates);

        let out = session.apply(SyncEvent::Snapshot(canonical));
        prop_assert_eq!(out.outgoing.len(), pending);
        prop_assert_eq!(session.store().len(), 8 + creates);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use ember_core::memory::{TABLE_ACTIONS, TABLE_MESSAGES};
    use ember_core::task::{TAG_AWAIT_INPUT, TAG_QUEUE};
    use ember_core::*;
    use ember_memory::{InMemoryStore, SqliteStore, StorageAdapter};
    use uuid::Uuid;

    fn backends() -> Vec<(&'static str, Arc<dyn StorageAdapter>)> {
        vec![
            ("memory", Arc::new(InMemoryStore::new())),
            ("sqlite", Arc::new(SqliteStore::open_in_memory().unwrap())),
        ]
    }

    fn message(room: Uuid, text: &str) -> Memory {
        Memory::new(Uuid::new_v4(), Uuid::new_v4(), room, Content::text(text), TABLE_MESSAGES)
    }

    fn room(id: Uuid, world: Option<Uuid>) -> Room {
        Room {
            id,
            agent_id: Uuid::new_v4(),
            name: Some("general".into()),
            source: "test".into(),
            channel_type: ChannelType::Group,
            channel_id: "c1".into(),
            world_id: world,
        }
    }

    // ── Memories ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_memory_is_insert_if_absent() {
        for (name, store) in backends() {
            let mem = message(Uuid::new_v4(), "hello");
            assert!(store.create_memory(&mem).await.unwrap(), "{name}");
            assert!(!store.create_memory(&mem).await.unwrap(), "{name}");
            let got = store.get_memory(mem.id).await.unwrap().unwrap();
            assert_eq!(got.text(), "hello", "{name}");
        }
    }

    #[tokio::test]
    async fn test_get_memories_newest_first_with_count() {
        for (name, store) in backends() {
            let room_id = Uuid::new_v4();
            let base = Utc::now();
            for i in 0..5 {
                let mut mem = message(room_id, &format!("m{i}"));
                mem.created_at = base + Duration::seconds(i);
                store.create_memory(&mem).await.unwrap();
            }
            store.create_memory(&message(Uuid::new_v4(), "elsewhere")).await.unwrap();

            let got = store
                .get_memories(&MemoryQuery::room(room_id).count(3))
                .await
                .unwrap();
            let texts: Vec<&str> = got.iter().map(|m| m.text()).collect();
            assert_eq!(texts, vec!["m4", "m3", "m2"], "{name}");
        }
    }

    #[tokio::test]
    async fn test_get_memories_filters_by_table() {
        for (name, store) in backends() {
            let room_id = Uuid::new_v4();
            store.create_memory(&message(room_id, "said")).await.unwrap();
            let mut action = message(room_id, "did");
            action.table = TABLE_ACTIONS.into();
            store.create_memory(&action).await.unwrap();

            let got = store
                .get_memories(&MemoryQuery::room(room_id).table(TABLE_ACTIONS))
                .await
                .unwrap();
            assert_eq!(got.len(), 1, "{name}");
            assert_eq!(got[0].text(), "did", "{name}");
        }
    }

    #[tokio::test]
    async fn test_delete_memory() {
        for (name, store) in backends() {
            let mem = message(Uuid::new_v4(), "bye");
            store.create_memory(&mem).await.unwrap();
            assert!(store.delete_memory(mem.id).await.unwrap(), "{name}");
            assert!(!store.delete_memory(mem.id).await.unwrap(), "{name}");
            assert!(store.get_memory(mem.id).await.unwrap().is_none(), "{name}");
        }
    }

    // ── Entities / rooms / worlds ──────────────────────────────

    #[tokio::test]
    async fn test_entity_create_and_update() {
        for (name, store) in backends() {
            let mut entity = Entity::new(Uuid::new_v4(), Uuid::new_v4(), Some("alice"));
            assert!(store.create_entity(&entity).await.unwrap(), "{name}");
            assert!(!store.create_entity(&entity).await.unwrap(), "{name}");

            entity.names.push("alice_w".into());
            store.update_entity(&entity).await.unwrap();
            let got = store.get_entity(entity.id).await.unwrap().unwrap();
            assert_eq!(got.names, vec!["alice", "alice_w"], "{name}");
        }
    }

    #[tokio::test]
    async fn test_update_missing_entity_is_not_found() {
        for (name, store) in backends() {
            let entity = Entity::new(Uuid::new_v4(), Uuid::new_v4(), None);
            let err = store.update_entity(&entity).await.unwrap_err();
            assert!(matches!(err, EmberError::NotFound(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn test_rooms_and_participants() {
        for (name, store) in backends() {
            let world_id = Uuid::new_v4();
            let room_id = Uuid::new_v4();
            let (alice, agent) = (Uuid::new_v4(), Uuid::new_v4());

            assert!(store.create_room(&room(room_id, Some(world_id))).await.unwrap());
            assert!(!store.create_room(&room(room_id, Some(world_id))).await.unwrap());
            store.create_room(&room(Uuid::new_v4(), None)).await.unwrap();

            let rooms = store.get_rooms_for_world(world_id).await.unwrap();
            assert_eq!(rooms.len(), 1, "{name}");
            assert_eq!(rooms[0].channel_type, ChannelType::Group, "{name}");

            assert!(store.add_participant(room_id, alice).await.unwrap());
            assert!(store.add_participant(room_id, agent).await.unwrap());
            assert!(!store.add_participant(room_id, alice).await.unwrap());
            assert_eq!(
                store.get_participants(room_id).await.unwrap(),
                vec![alice, agent],
                "{name}"
            );
            assert_eq!(store.get_rooms_for_entity(alice).await.unwrap(), vec![room_id]);
        }
    }

    #[tokio::test]
    async fn test_world_settings_persist() {
        for (name, store) in backends() {
            let mut world = World {
                id: Uuid::new_v4(),
                agent_id: Uuid::new_v4(),
                name: Some("guild".into()),
                server_id: "s1".into(),
                owner_id: None,
                metadata: Default::default(),
            };
            store.create_world(&world).await.unwrap();

            let mut settings = WorldSettings::new();
            settings.insert("lang", Setting::new("Language", "Reply language", true));
            settings.update("lang", serde_json::json!("en")).unwrap();
            world.set_settings(&settings).unwrap();
            store.update_world(&world).await.unwrap();

            let got = store.get_world(world.id).await.unwrap().unwrap();
            let restored = got.settings().unwrap();
            assert_eq!(restored.value("lang"), Some(&serde_json::json!("en")), "{name}");
        }
    }

    // ── Tasks ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_task_filter_by_tag_and_room() {
        for (name, store) in backends() {
            let room_id = Uuid::new_v4();
            let queued = NewTask::new("digest").tag(TAG_QUEUE).into_task();
            let waiting = NewTask::new("choice")
                .tag(TAG_AWAIT_INPUT)
                .room(room_id)
                .into_task();
            store.create_task(&queued).await.unwrap();
            store.create_task(&waiting).await.unwrap();

            let got = store.get_tasks(&TaskFilter::tagged(TAG_QUEUE)).await.unwrap();
            assert_eq!(got.len(), 1, "{name}");
            assert_eq!(got[0].name, "digest", "{name}");

            let got = store
                .get_tasks(&TaskFilter::tagged(TAG_AWAIT_INPUT).in_room(room_id))
                .await
                .unwrap();
            assert_eq!(got.len(), 1, "{name}");

            let got = store
                .get_tasks(&TaskFilter::default().named("digest"))
                .await
                .unwrap();
            assert_eq!(got[0].id, queued.id, "{name}");
        }
    }

    #[tokio::test]
    async fn test_task_update_and_delete_claim() {
        for (name, store) in backends() {
            let mut task = NewTask::new("once").tag(TAG_QUEUE).into_task();
            store.create_task(&task).await.unwrap();

            task.run_count = 3;
            store.update_task(&task).await.unwrap();
            assert_eq!(store.get_task(task.id).await.unwrap().unwrap().run_count, 3);

            assert!(store.delete_task(task.id).await.unwrap(), "{name}");
            assert!(!store.delete_task(task.id).await.unwrap(), "{name}");
            assert!(store.get_task(task.id).await.unwrap().is_none(), "{name}");
        }
    }

    // ── SQLite specifics ───────────────────────────────────────

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.db");
        let mem = message(Uuid::new_v4(), "durable");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.init().await.unwrap();
            store.create_memory(&mem).await.unwrap();
            store.close().await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let got = store.get_memory(mem.id).await.unwrap().unwrap();
        assert_eq!(got, mem);
    }

    #[tokio::test]
    async fn test_in_memory_count() {
        let store = InMemoryStore::new();
        store.create_memory(&message(Uuid::new_v4(), "a")).await.unwrap();
        store.create_memory(&message(Uuid::new_v4(), "b")).await.unwrap();
        assert_eq!(store.memory_count(), 2);
    }
}

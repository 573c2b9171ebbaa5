//! First-contact bookkeeping: make sure the world, room and participants a
//! message refers to exist in storage.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use ember_core::{Entity, IdentityMapper, IncomingMessage, Result, Room, World};
use ember_memory::StorageAdapter;

/// Storage ids a message resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub entity_id: Uuid,
    pub room_id: Uuid,
    pub world_id: Uuid,
    pub agent_entity_id: Uuid,
}

/// Create or merge the entity, world and room behind `message` and add the
/// author and the agent as room participants.
pub async fn ensure_connection(
    storage: &dyn StorageAdapter,
    mapper: &IdentityMapper,
    agent_name: &str,
    message: &IncomingMessage,
) -> Result<Connection> {
    let agent_id = mapper.agent_id();
    let world_id = mapper.world(message.world_key());
    let room_id = mapper.room(&message.channel_id);
    let entity_id = mapper.entity(&message.author_id);
    let agent_entity_id = mapper.entity(&agent_id.to_string());

    let world = World {
        id: world_id,
        agent_id,
        name: None,
        server_id: message.world_key().to_string(),
        owner_id: None,
        metadata: Default::default(),
    };
    if storage.create_world(&world).await? {
        debug!(world = %world_id, source = %message.source, "world created");
    }

    let room = Room {
        id: room_id,
        agent_id,
        name: None,
        source: message.source.clone(),
        channel_type: message.channel_type,
        channel_id: message.channel_id.clone(),
        world_id: Some(world_id),
    };
    if storage.create_room(&room).await? {
        debug!(room = %room_id, channel = %message.channel_id, "room created");
    }

    let mut author = Entity::new(entity_id, agent_id, message.author_name.as_deref());
    author.metadata.insert(
        message.source.clone(),
        json!({ "id": message.author_id, "name": message.author_name }),
    );
    upsert_entity(storage, &author).await?;
    upsert_entity(storage, &Entity::new(agent_entity_id, agent_id, Some(agent_name))).await?;

    storage.add_participant(room_id, entity_id).await?;
    storage.add_participant(room_id, agent_entity_id).await?;

    Ok(Connection {
        entity_id,
        room_id,
        world_id,
        agent_entity_id,
    })
}

/// Insert a new entity, or merge new names and metadata into the stored one.
async fn upsert_entity(storage: &dyn StorageAdapter, entity: &Entity) -> Result<()> {
    if storage.create_entity(entity).await? {
        debug!(entity = %entity.id, "entity created");
        return Ok(());
    }
    if let Some(mut existing) = storage.get_entity(entity.id).await?
        && existing.merge(entity)
    {
        storage.update_entity(&existing).await?;
        debug!(entity = %entity.id, "entity merged");
    }
    Ok(())
}

//! Session context
//!
//! Process-wide call state owned by the room controller: the current room,
//! the local media bundle and the session registry. Created when the engine
//! starts, torn down on shutdown.

use super::media::LocalMediaBundle;
use super::registry::SessionRegistry;
use super::shared::RoomId;
use std::sync::Arc;

#[derive(Debug)]
pub struct SessionContext {
    display_name: String,
    current_room: Option<RoomId>,
    local_media: Option<Arc<LocalMediaBundle>>,
    registry: SessionRegistry,
    generation: u64,
}

impl SessionContext {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            current_room: None,
            local_media: None,
            registry: SessionRegistry::new(),
            generation: 0,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn current_room(&self) -> Option<&RoomId> {
        self.current_room.as_ref()
    }

    pub fn set_current_room(&mut self, room: RoomId) {
        self.current_room = Some(room);
    }

    pub fn clear_current_room(&mut self) -> Option<RoomId> {
        self.current_room.take()
    }

    pub fn local_media(&self) -> Option<&Arc<LocalMediaBundle>> {
        self.local_media.as_ref()
    }

    pub fn has_local_media(&self) -> bool {
        self.local_media.is_some()
    }

    pub fn set_local_media(&mut self, media: Arc<LocalMediaBundle>) {
        self.local_media = Some(media);
    }

    /// Stop the local tracks and drop the bundle
    pub fn release_local_media(&mut self) -> bool {
        match self.local_media.take() {
            Some(media) => {
                media.stop();
                true
            }
            None => false,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    /// Generation tag for the next session created
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_increase() {
        let mut ctx = SessionContext::new("Anonymous");
        let a = ctx.next_generation();
        let b = ctx.next_generation();
        assert!(b > a);
    }

    #[test]
    fn test_release_local_media() {
        let mut ctx = SessionContext::new("Anonymous");
        assert!(!ctx.release_local_media());

        ctx.set_local_media(Arc::new(LocalMediaBundle::new("s", Vec::new(), None)));
        assert!(ctx.has_local_media());
        assert!(ctx.release_local_media());
        assert!(ctx.local_media().is_none());
    }
}

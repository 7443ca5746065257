use crate::types::message::{MessageDisplay, MessageStatus};

/// The ordered, user-visible messages of one room. Ids are unique.
#[derive(Debug, Default, Clone)]
pub struct MessageList {
    items: Vec<MessageDisplay>,
}

impl MessageList {
    pub fn items(&self) -> &[MessageDisplay] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&MessageDisplay> {
        self.items.iter().find(|m| m.id == id)
    }

    /// Append unless the id is already listed. Returns whether it was added.
    pub fn push(&mut self, message: MessageDisplay) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.items.push(message);
        true
    }

    /// Swap a local id for the server id in place.
    ///
    /// If the server's echo of the message was listed before the
    /// acknowledgement arrived, that entry is dropped so the message keeps
    /// the position of the local one. The flag reports whether that happened.
    pub fn confirm(
        &mut self,
        local_id: &str,
        server_id: &str,
        status: MessageStatus,
    ) -> Option<(MessageDisplay, bool)> {
        let mut index = self.position(local_id)?;
        let mut dropped_echo = false;
        if local_id != server_id
            && let Some(echo) = self.position(server_id)
        {
            self.items.remove(echo);
            if echo < index {
                index -= 1;
            }
            dropped_echo = true;
        }
        let entry = &mut self.items[index];
        entry.id = server_id.to_string();
        entry.status = status;
        Some((entry.clone(), dropped_echo))
    }

    pub fn set_status(&mut self, id: &str, status: MessageStatus) -> Option<MessageDisplay> {
        let entry = self.items.iter_mut().find(|m| m.id == id)?;
        entry.status = status;
        Some(entry.clone())
    }

    pub fn remove(&mut self, id: &str) -> Option<MessageDisplay> {
        let index = self.position(id)?;
        Some(self.items.remove(index))
    }
}

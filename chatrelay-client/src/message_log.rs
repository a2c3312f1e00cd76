use chatrelay_core::Message;

/// Which side of the conversation a logged message is drawn on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sent,
    Received,
}

impl Side {
    /// `Sent` only when the message carries the given, known identity.
    pub fn of(message: &Message, identity: Option<&str>) -> Self {
        match identity {
            Some(identity) if message.sender() == identity => Side::Sent,
            _ => Side::Received,
        }
    }
}

/// Append-only, insertion-ordered message history of one mounted chat screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index the message landed at.
    pub fn append(&mut self, message: Message) -> usize {
        self.entries.push(message);
        self.entries.len() - 1
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn view<'a>(
        &'a self,
        identity: Option<&'a str>,
    ) -> impl Iterator<Item = (Side, &'a Message)> + 'a {
        self.entries
            .iter()
            .map(move |message| (Side::of(message, identity), message))
    }
}

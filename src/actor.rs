//! Tagged actor sum type, replacing the inheritance-style DS/Requester/System
//! polymorphism named in the design notes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Actor {
    Ds,
    Requester,
    System,
}

impl Actor {
    pub fn label(&self) -> &'static str {
        match self {
            Actor::Ds => "ds",
            Actor::Requester => "requester",
            Actor::System => "system",
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges route published messages to bound queues. The bus supports the
//! three routing styles its queue configurations can name: direct, fanout and
//! topic. Exchange definitions are built with a small builder and installed by
//! [`crate::topology::AmqpTopology`].

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Routing style of an exchange: exact routing key match, broadcast to every
/// bound queue, or wildcard pattern match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(AmqpError::ConfigurationError(format!(
                "unsupported exchange type {other}"
            ))),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// An exchange to declare. Exchanges are never auto-deleted nor internal;
/// the bus marks the ones it owns durable.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::default(),
            durable: false,
        }
    }

    pub fn kind(self, kind: ExchangeKind) -> Self {
        ExchangeDefinition { kind, ..self }
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn durable(self) -> Self {
        ExchangeDefinition {
            durable: true,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exchange_kinds_case_insensitively() {
        assert_eq!("Fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert!(matches!(
            "headers".parse::<ExchangeKind>(),
            Err(AmqpError::ConfigurationError(_))
        ));
    }

    #[test]
    fn maps_onto_lapin_kinds() {
        let kind: lapin::ExchangeKind = ExchangeKind::Topic.into();
        assert!(matches!(kind, lapin::ExchangeKind::Topic));
    }

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("orders").fanout().durable();
        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(def.durable);
    }
}

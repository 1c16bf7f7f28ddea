//! Object graph resolution
//!
//! Walks an [`ArchiveNode`] skeleton, following references into the object
//! table on demand, and produces a [`ResolvedValue`] tree. The table is never
//! mutated, so two containers referencing the same object each get their own
//! resolved copy.

use super::codec::{ObjectDecoder, ObjectTable};
use super::{ArchiveNode, Mapping, ResolvedValue, Scalar, CLASS_KEY};
use crate::error::DecodeError;

/// Limits applied while resolving untrusted archives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Maximum container nesting depth before resolution is rejected
    pub max_depth: usize,
    /// Extra reference-to-reference hops followed before giving up on a slot
    pub max_reference_hops: usize,
    /// Values produced per `resolve` call before the archive is rejected
    ///
    /// Shared references are expanded once per path through them, so this
    /// caps archives that fan out exponentially within the depth limit.
    pub max_nodes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_reference_hops: 1,
            max_nodes: 100_000,
        }
    }
}

/// Resolves keyed-archive skeletons against one object table
pub struct ObjectGraphResolver<'a, D: ObjectDecoder + ?Sized> {
    table: &'a ObjectTable,
    decoder: &'a D,
    config: ResolverConfig,
}

impl<'a, D: ObjectDecoder + ?Sized> ObjectGraphResolver<'a, D> {
    pub fn new(table: &'a ObjectTable, decoder: &'a D) -> Self {
        Self {
            table,
            decoder,
            config: ResolverConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve a root, which may be a reference or an already decoded node
    pub fn resolve(&self, root: &ArchiveNode) -> Result<ResolvedValue, DecodeError> {
        let mut budget = self.config.max_nodes;
        self.resolve_node(root, 0, &mut budget)
    }

    fn resolve_node(
        &self,
        node: &ArchiveNode,
        depth: usize,
        budget: &mut usize,
    ) -> Result<ResolvedValue, DecodeError> {
        if *budget == 0 {
            tracing::warn!(
                "Archive expanded past {} values; rejecting record",
                self.config.max_nodes
            );
            return Err(DecodeError::ResolutionBudgetExceeded(self.config.max_nodes));
        }
        *budget -= 1;

        if depth > self.config.max_depth {
            tracing::warn!(
                "Archive nesting exceeded {} levels; rejecting record",
                self.config.max_depth
            );
            return Err(DecodeError::DepthLimitExceeded(self.config.max_depth));
        }

        match node {
            ArchiveNode::Mapping(entries) => {
                let mut mapping = Mapping::new();
                for (key, value) in entries {
                    if key == CLASS_KEY {
                        continue;
                    }
                    mapping.insert(key.clone(), self.resolve_node(value, depth + 1, budget)?);
                }
                Ok(ResolvedValue::Mapping(mapping))
            }
            ArchiveNode::Sequence(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve_node(item, depth + 1, budget)?);
                }
                Ok(ResolvedValue::Sequence(resolved))
            }
            ArchiveNode::Reference(index) => {
                let decoded = self.follow(*index)?;
                match decoded {
                    ArchiveNode::Reference(_) => Ok(ResolvedValue::Scalar(Scalar::Null)),
                    other => self.resolve_node(&other, depth, budget),
                }
            }
            ArchiveNode::Scalar(scalar) => Ok(ResolvedValue::Scalar(scalar.clone())),
        }
    }

    /// Decode the referenced object, following at most `max_reference_hops`
    /// further references. A chain that is still unresolved is returned as-is.
    fn follow(&self, index: u64) -> Result<ArchiveNode, DecodeError> {
        let mut decoded = self.decoder.decode_object(self.table, index)?;
        let mut hops = 0;
        while let ArchiveNode::Reference(next) = decoded {
            if hops == self.config.max_reference_hops {
                tracing::warn!(
                    "Reference chain from object {} is longer than {} hop(s); treating as null",
                    index,
                    self.config.max_reference_hops
                );
                return Ok(ArchiveNode::Reference(next));
            }
            hops += 1;
            decoded = self.decoder.decode_object(self.table, next)?;
        }
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::codec::ArchiveCodec;
    use plist::{Uid, Value};

    fn uid(index: u64) -> Value {
        Value::Uid(Uid::new(index))
    }

    fn dict(pairs: Vec<(&str, Value)>) -> Value {
        Value::Dictionary(
            pairs
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    fn text(value: &str) -> Value {
        Value::String(value.to_string())
    }

    /// Object table for a small archive:
    /// root { "$class", "zeta" -> "shared", "alpha" -> [1, "shared"], "nested" -> {"inner": true} }
    fn sample_table() -> ObjectTable {
        ObjectTable::new(vec![
            text("$null"),
            dict(vec![
                ("$class", uid(4)),
                ("zeta", uid(2)),
                ("alpha", uid(3)),
                ("nested", dict(vec![("inner", Value::Boolean(true))])),
            ]),
            text("shared"),
            Value::Array(vec![Value::Integer(1.into()), uid(2)]),
            dict(vec![("$classname", text("Thing"))]),
        ])
    }

    fn scalar_text(value: &str) -> ResolvedValue {
        ResolvedValue::Scalar(Scalar::Text(value.to_string()))
    }

    #[test]
    fn test_resolves_mapping_in_input_order_without_class_tag() {
        let table = sample_table();
        let codec = ArchiveCodec::default();
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap();

        let mapping = resolved.as_mapping().unwrap();
        assert_eq!(
            mapping.keys().collect::<Vec<_>>(),
            vec!["zeta", "alpha", "nested"]
        );
        assert!(!mapping.contains_key(CLASS_KEY));
        assert_eq!(mapping.get("zeta"), Some(&scalar_text("shared")));
        assert_eq!(
            mapping.get("alpha"),
            Some(&ResolvedValue::Sequence(vec![
                ResolvedValue::Scalar(Scalar::Integer(1)),
                scalar_text("shared"),
            ]))
        );
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let table = sample_table();
        let codec = ArchiveCodec::default();
        let resolver = ObjectGraphResolver::new(&table, &codec);

        let first = resolver.resolve(&ArchiveNode::Reference(1)).unwrap();
        let second = resolver.resolve(&ArchiveNode::Reference(1)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_materialized_root_is_resolved_structurally() {
        let table = sample_table();
        let codec = ArchiveCodec::default();
        let root = ArchiveNode::Sequence(vec![
            ArchiveNode::Reference(2),
            ArchiveNode::Scalar(Scalar::Boolean(false)),
            ArchiveNode::Mapping(vec![
                ("$class".to_string(), ArchiveNode::Reference(4)),
                ("k".to_string(), ArchiveNode::Reference(0)),
            ]),
        ]);

        let resolved = ObjectGraphResolver::new(&table, &codec)
            .resolve(&root)
            .unwrap();

        let mut expected_mapping = Mapping::new();
        expected_mapping.insert("k", ResolvedValue::Scalar(Scalar::Null));
        assert_eq!(
            resolved,
            ResolvedValue::Sequence(vec![
                scalar_text("shared"),
                ResolvedValue::Scalar(Scalar::Boolean(false)),
                ResolvedValue::Mapping(expected_mapping),
            ])
        );
    }

    #[test]
    fn test_scalar_root_passes_through() {
        let table = ObjectTable::default();
        let codec = ArchiveCodec::default();
        let root = ArchiveNode::Scalar(Scalar::Real(1.5));
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .resolve(&root)
            .unwrap();
        assert_eq!(resolved, ResolvedValue::Scalar(Scalar::Real(1.5)));
    }

    #[test]
    fn test_self_reference_hits_depth_limit() {
        let table = ObjectTable::new(vec![text("$null"), dict(vec![("me", uid(1))])]);
        let codec = ArchiveCodec::default();
        let err = ObjectGraphResolver::new(&table, &codec)
            .with_config(ResolverConfig {
                max_depth: 8,
                ..Default::default()
            })
            .resolve(&ArchiveNode::Reference(1))
            .unwrap_err();
        assert!(matches!(err, DecodeError::DepthLimitExceeded(8)));
    }

    #[test]
    fn test_single_extra_hop_is_followed() {
        let table = ObjectTable::new(vec![text("$null"), uid(2), text("target")]);
        let codec = ArchiveCodec::default();
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap();
        assert_eq!(resolved, scalar_text("target"));
    }

    #[test]
    fn test_reference_cycle_resolves_to_null() {
        let table = ObjectTable::new(vec![text("$null"), uid(2), uid(1)]);
        let codec = ArchiveCodec::default();
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap();
        assert_eq!(resolved, ResolvedValue::Scalar(Scalar::Null));
    }

    #[test]
    fn test_hop_limit_is_configurable() {
        let table = ObjectTable::new(vec![text("$null"), uid(2), uid(3), text("deep")]);
        let codec = ArchiveCodec::default();
        let config = ResolverConfig {
            max_reference_hops: 2,
            ..Default::default()
        };
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .with_config(config)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap();
        assert_eq!(resolved, scalar_text("deep"));
    }

    /// Object k is `[uid(k+1), uid(k+1)]`; full expansion visits 2^(levels+1) - 1
    /// references, each counted once for the reference and once for its target
    fn doubling_table(levels: u64) -> ObjectTable {
        let mut objects = vec![text("$null")];
        for k in 1..=levels {
            objects.push(Value::Array(vec![uid(k + 1), uid(k + 1)]));
        }
        objects.push(text("leaf"));
        ObjectTable::new(objects)
    }

    #[test]
    fn test_exponential_fan_out_is_rejected() {
        let table = doubling_table(40);
        let codec = ArchiveCodec::default();
        let err = ObjectGraphResolver::new(&table, &codec)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ResolutionBudgetExceeded(100_000)));
    }

    #[test]
    fn test_fan_out_within_budget_resolves() {
        let table = doubling_table(3);
        let codec = ArchiveCodec::default();
        let config = ResolverConfig {
            max_nodes: 30,
            ..Default::default()
        };
        let resolved = ObjectGraphResolver::new(&table, &codec)
            .with_config(config)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap();
        let ResolvedValue::Sequence(top) = resolved else {
            panic!("expected a sequence");
        };
        assert_eq!(top.len(), 2);

        let tight = ResolverConfig {
            max_nodes: 29,
            ..Default::default()
        };
        let err = ObjectGraphResolver::new(&table, &codec)
            .with_config(tight)
            .resolve(&ArchiveNode::Reference(1))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ResolutionBudgetExceeded(29)));
    }

    #[test]
    fn test_dangling_reference_is_an_error() {
        let table = ObjectTable::new(vec![text("$null")]);
        let codec = ArchiveCodec::default();
        let err = ObjectGraphResolver::new(&table, &codec)
            .resolve(&ArchiveNode::Reference(42))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ObjectIndexOutOfRange { .. }));
    }
}

//! The algebraic layer: private/blind key generation and the key-path fold

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::RngCore;
use tgdh_core::{GroupConfig, NodePos, Result, TgdhError};
use tgdh_tree::KeyTree;
use tracing::instrument;

/// The algebraic layer of TGDH, parameterised by a modular group
/// `(generator, modulus)`. Holds no tree state of its own; every method
/// takes the tree (or raw scalars) it needs to act on.
#[derive(Debug, Clone)]
pub struct KeyEngine {
    generator: BigUint,
    modulus: BigUint,
}

impl KeyEngine {
    /// Build an engine from a loaded [`GroupConfig`].
    pub fn new(config: &GroupConfig) -> Result<Self> {
        let generator = parse_biguint(&config.generator)?;
        let modulus = parse_biguint(&config.modulus)?;
        if modulus < BigUint::from(2u32) {
            return Err(TgdhError::configuration("modulus must be at least 2"));
        }
        Ok(Self { generator, modulus })
    }

    /// The generator `g`.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// The modulus `p`.
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Draw a private scalar uniformly from `[1, p-1]`.
    pub fn gen_private(&self, rng: &mut impl RngCore) -> BigUint {
        rng.gen_biguint_range(&BigUint::one(), &self.modulus)
    }

    /// `g^priv mod p`.
    pub fn gen_blind(&self, priv_scalar: &BigUint) -> BigUint {
        self.generator.modpow(priv_scalar, &self.modulus)
    }

    /// `peer_blind^my_priv mod p`. Symmetric: both children of a node
    /// derive the same value from the same pair of scalars.
    pub fn combine(&self, my_priv: &BigUint, peer_blind: &BigUint) -> Result<BigUint> {
        self.validate_blind(peer_blind)?;
        Ok(peer_blind.modpow(my_priv, &self.modulus))
    }

    /// A blind value must be strictly between 0 and the modulus.
    pub fn validate_blind(&self, blind: &BigUint) -> Result<()> {
        if blind.is_zero() || blind >= &self.modulus {
            return Err(TgdhError::bad_key_material(format!(
                "blind value {blind} is out of range for modulus {}",
                self.modulus
            )));
        }
        Ok(())
    }

    /// Fold one level of the key-path: combine `current_pos`'s private
    /// scalar with its sibling's blind value, write the result (and, for
    /// a non-Root destination, a freshly derived blind) onto the parent
    /// node, and return the parent's position.
    ///
    /// Used by the coordinator's per-level barrier, where a member only
    /// learns one co-path blind at a time rather than the whole path at
    /// once.
    pub fn derive_one_level(&self, tree: &mut KeyTree, current_pos: NodePos) -> Result<NodePos> {
        if current_pos == NodePos::ROOT {
            return Err(TgdhError::protocol_state("already at the root; nothing to derive"));
        }
        let current_priv = tree
            .find_by_pos(current_pos)
            .and_then(|n| n.priv_scalar.clone())
            .ok_or_else(|| {
                TgdhError::protocol_state(format!("{current_pos} has no private scalar"))
            })?;
        let sibling_pos = tree
            .sibling(current_pos)
            .ok_or_else(|| TgdhError::protocol_state(format!("{current_pos} has no sibling")))?;
        let sibling_blind = tree
            .find_by_pos(sibling_pos)
            .and_then(|n| n.blind.clone())
            .ok_or_else(|| {
                TgdhError::protocol_state(format!("{sibling_pos} has no blind value yet"))
            })?;
        let parent_pos = NodePos::new(current_pos.l - 1, current_pos.v / 2);
        let next_priv = self.combine(&current_priv, &sibling_blind)?;
        let next_blind = if parent_pos == NodePos::ROOT {
            None
        } else {
            Some(self.gen_blind(&next_priv))
        };
        tree.set_node_keys(parent_pos, Some(next_priv), next_blind)?;
        Ok(parent_pos)
    }

    /// Walk `my_pos`'s key-path to the Root, folding each co-path blind
    /// key into the next key-path scalar. Every updated value is staged
    /// before any node is written; a `BadKeyMaterial` failure at any step
    /// leaves the tree exactly as it was.
    ///
    /// Precondition: `my_pos`'s node has a private scalar set and every
    /// co-path node's blind value is known. Postcondition: the Root's
    /// private scalar is the group key.
    #[instrument(skip(self, tree), fields(my_pos = %my_pos))]
    pub fn derive_path(&self, tree: &mut KeyTree, my_pos: NodePos) -> Result<()> {
        let key_path = tree
            .path_to_root(my_pos)
            .ok_or_else(|| TgdhError::protocol_state(format!("no key-path for {my_pos}")))?;
        let co_path = tree
            .co_path(my_pos)
            .ok_or_else(|| TgdhError::protocol_state(format!("no co-path for {my_pos}")))?;

        let mut current_priv = tree
            .find_by_pos(my_pos)
            .and_then(|n| n.priv_scalar.clone())
            .ok_or_else(|| {
                TgdhError::protocol_state(format!("{my_pos} has no private scalar to derive from"))
            })?;

        let mut staged: Vec<(NodePos, BigUint, Option<BigUint>)> = Vec::with_capacity(co_path.len());
        for (i, co_pos) in co_path.iter().enumerate() {
            let peer_blind = tree
                .find_by_pos(*co_pos)
                .and_then(|n| n.blind.clone())
                .ok_or_else(|| {
                    TgdhError::protocol_state(format!("{co_pos} has no blind value to fold in"))
                })?;
            let next_pos = key_path[i + 1];
            let next_priv = self.combine(&current_priv, &peer_blind)?;
            let next_blind = if next_pos == NodePos::ROOT {
                None
            } else {
                Some(self.gen_blind(&next_priv))
            };
            staged.push((next_pos, next_priv.clone(), next_blind));
            current_priv = next_priv;
        }

        for (pos, priv_scalar, blind) in staged {
            tree.set_node_keys(pos, Some(priv_scalar), blind)?;
        }
        Ok(())
    }
}

fn parse_biguint(value: &str) -> Result<BigUint> {
    value
        .parse::<BigUint>()
        .map_err(|err| TgdhError::configuration(format!("invalid decimal integer {value:?}: {err}")))
}

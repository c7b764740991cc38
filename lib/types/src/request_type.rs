use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of circuits the prover network knows how to prove.
///
/// The set is closed: adding a circuit means adding a variant here, which forces every
/// exhaustive `match` over the type (request construction, agents, metrics) to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvingRequestType {
    BaseParity,
    RootParity,
    PrivateBaseRollup,
    PublicBaseRollup,
    MergeRollup,
    BlockRootRollup,
    SingleTxBlockRootRollup,
    EmptyBlockRootRollup,
    BlockMergeRollup,
    RootRollup,
    PublicKernelNonTail,
    Tube,
    Avm,
}

impl ProvingRequestType {
    pub const ALL: [ProvingRequestType; 13] = [
        Self::BaseParity,
        Self::RootParity,
        Self::PrivateBaseRollup,
        Self::PublicBaseRollup,
        Self::MergeRollup,
        Self::BlockRootRollup,
        Self::SingleTxBlockRootRollup,
        Self::EmptyBlockRootRollup,
        Self::BlockMergeRollup,
        Self::RootRollup,
        Self::PublicKernelNonTail,
        Self::Tube,
        Self::Avm,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BaseParity => "base_parity",
            Self::RootParity => "root_parity",
            Self::PrivateBaseRollup => "private_base_rollup",
            Self::PublicBaseRollup => "public_base_rollup",
            Self::MergeRollup => "merge_rollup",
            Self::BlockRootRollup => "block_root_rollup",
            Self::SingleTxBlockRootRollup => "single_tx_block_root_rollup",
            Self::EmptyBlockRootRollup => "empty_block_root_rollup",
            Self::BlockMergeRollup => "block_merge_rollup",
            Self::RootRollup => "root_rollup",
            Self::PublicKernelNonTail => "public_kernel_non_tail",
            Self::Tube => "tube",
            Self::Avm => "avm",
        }
    }

    /// Whether the circuit recursively verifies two child proofs.
    pub const fn is_aggregation(self) -> bool {
        match self {
            Self::MergeRollup | Self::BlockRootRollup | Self::BlockMergeRollup | Self::RootRollup => {
                true
            }
            Self::BaseParity
            | Self::RootParity
            | Self::PrivateBaseRollup
            | Self::PublicBaseRollup
            | Self::SingleTxBlockRootRollup
            | Self::EmptyBlockRootRollup
            | Self::PublicKernelNonTail
            | Self::Tube
            | Self::Avm => false,
        }
    }
}

impl fmt::Display for ProvingRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown proving request type: {0}")]
pub struct UnknownRequestType(pub String);

impl FromStr for ProvingRequestType {
    type Err = UnknownRequestType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == normalized)
            .ok_or_else(|| UnknownRequestType(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip_through_from_str() {
        for ty in ProvingRequestType::ALL {
            assert_eq!(ty.as_str().parse::<ProvingRequestType>().unwrap(), ty);
        }
        assert_eq!(
            "BLOCK-ROOT-ROLLUP".parse::<ProvingRequestType>().unwrap(),
            ProvingRequestType::BlockRootRollup
        );
        assert!("merge".parse::<ProvingRequestType>().is_err());
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&ProvingRequestType::EmptyBlockRootRollup).unwrap();
        assert_eq!(json, "\"empty_block_root_rollup\"");
    }
}

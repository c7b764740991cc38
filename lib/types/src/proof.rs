use crate::error::ProvingError;
use crate::request_type::ProvingRequestType;
use crate::vk_tree::VkMembershipWitness;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_bytes {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let head = &self.0[..self.0.len().min(8)];
                write!(f, "{}(0x{}.., {} bytes)", stringify!($name), hex::encode(head), self.0.len())
            }
        }
    };
}

opaque_bytes!(
    /// Public inputs of a circuit, compared structurally by the consistency check.
    PublicInputs
);
opaque_bytes!(
    /// Recursive proof bytes.
    Proof
);
opaque_bytes!(VerificationKey);
opaque_bytes!(
    /// Circuit inputs this crate never looks into.
    OpaqueInputs
);

/// Result of proving one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOutput {
    pub public_inputs: PublicInputs,
    pub proof: Proof,
    pub verification_key: VerificationKey,
}

/// One recursively verified child of an aggregation circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProof {
    pub public_inputs: PublicInputs,
    pub proof: Proof,
    pub verification_key: VerificationKey,
    /// Proves `verification_key` belongs to the recognized VK set.
    pub vk_witness: VkMembershipWitness,
}

/// Inputs of a circuit merging two child proofs (left, right).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationInputs {
    pub children: [ChildProof; 2],
}

/// Typed proving request: one variant per circuit kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvingRequest {
    BaseParity(OpaqueInputs),
    RootParity(OpaqueInputs),
    PrivateBaseRollup(OpaqueInputs),
    PublicBaseRollup(OpaqueInputs),
    MergeRollup(AggregationInputs),
    BlockRootRollup(AggregationInputs),
    SingleTxBlockRootRollup(OpaqueInputs),
    EmptyBlockRootRollup(OpaqueInputs),
    BlockMergeRollup(AggregationInputs),
    RootRollup(AggregationInputs),
    PublicKernelNonTail(OpaqueInputs),
    Tube(OpaqueInputs),
    Avm(OpaqueInputs),
}

impl ProvingRequest {
    pub fn request_type(&self) -> ProvingRequestType {
        match self {
            ProvingRequest::BaseParity(_) => ProvingRequestType::BaseParity,
            ProvingRequest::RootParity(_) => ProvingRequestType::RootParity,
            ProvingRequest::PrivateBaseRollup(_) => ProvingRequestType::PrivateBaseRollup,
            ProvingRequest::PublicBaseRollup(_) => ProvingRequestType::PublicBaseRollup,
            ProvingRequest::MergeRollup(_) => ProvingRequestType::MergeRollup,
            ProvingRequest::BlockRootRollup(_) => ProvingRequestType::BlockRootRollup,
            ProvingRequest::SingleTxBlockRootRollup(_) => {
                ProvingRequestType::SingleTxBlockRootRollup
            }
            ProvingRequest::EmptyBlockRootRollup(_) => ProvingRequestType::EmptyBlockRootRollup,
            ProvingRequest::BlockMergeRollup(_) => ProvingRequestType::BlockMergeRollup,
            ProvingRequest::RootRollup(_) => ProvingRequestType::RootRollup,
            ProvingRequest::PublicKernelNonTail(_) => ProvingRequestType::PublicKernelNonTail,
            ProvingRequest::Tube(_) => ProvingRequestType::Tube,
            ProvingRequest::Avm(_) => ProvingRequestType::Avm,
        }
    }

    /// Builds the request for an aggregation circuit.
    pub fn aggregation(
        ty: ProvingRequestType,
        inputs: AggregationInputs,
    ) -> Result<Self, ProvingError> {
        Ok(match ty {
            ProvingRequestType::MergeRollup => ProvingRequest::MergeRollup(inputs),
            ProvingRequestType::BlockRootRollup => ProvingRequest::BlockRootRollup(inputs),
            ProvingRequestType::BlockMergeRollup => ProvingRequest::BlockMergeRollup(inputs),
            ProvingRequestType::RootRollup => ProvingRequest::RootRollup(inputs),
            ProvingRequestType::BaseParity
            | ProvingRequestType::RootParity
            | ProvingRequestType::PrivateBaseRollup
            | ProvingRequestType::PublicBaseRollup
            | ProvingRequestType::SingleTxBlockRootRollup
            | ProvingRequestType::EmptyBlockRootRollup
            | ProvingRequestType::PublicKernelNonTail
            | ProvingRequestType::Tube
            | ProvingRequestType::Avm => {
                return Err(ProvingError::Fatal(format!(
                    "{ty} does not aggregate child proofs"
                )));
            }
        })
    }

    /// Builds the request for a circuit whose inputs are opaque to the coordinator.
    pub fn opaque(ty: ProvingRequestType, inputs: OpaqueInputs) -> Result<Self, ProvingError> {
        Ok(match ty {
            ProvingRequestType::BaseParity => ProvingRequest::BaseParity(inputs),
            ProvingRequestType::RootParity => ProvingRequest::RootParity(inputs),
            ProvingRequestType::PrivateBaseRollup => ProvingRequest::PrivateBaseRollup(inputs),
            ProvingRequestType::PublicBaseRollup => ProvingRequest::PublicBaseRollup(inputs),
            ProvingRequestType::SingleTxBlockRootRollup => {
                ProvingRequest::SingleTxBlockRootRollup(inputs)
            }
            ProvingRequestType::EmptyBlockRootRollup => {
                ProvingRequest::EmptyBlockRootRollup(inputs)
            }
            ProvingRequestType::PublicKernelNonTail => ProvingRequest::PublicKernelNonTail(inputs),
            ProvingRequestType::Tube => ProvingRequest::Tube(inputs),
            ProvingRequestType::Avm => ProvingRequest::Avm(inputs),
            ProvingRequestType::MergeRollup
            | ProvingRequestType::BlockRootRollup
            | ProvingRequestType::BlockMergeRollup
            | ProvingRequestType::RootRollup => {
                return Err(ProvingError::Fatal(format!(
                    "{ty} expects aggregation inputs"
                )));
            }
        })
    }

    pub fn aggregation_inputs(&self) -> Option<&AggregationInputs> {
        match self {
            ProvingRequest::MergeRollup(inputs)
            | ProvingRequest::BlockRootRollup(inputs)
            | ProvingRequest::BlockMergeRollup(inputs)
            | ProvingRequest::RootRollup(inputs) => Some(inputs),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProvingError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|err| ProvingError::fatal(format!("cannot encode proving request: {err}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProvingError> {
        let (request, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|err| ProvingError::fatal(format!("cannot decode proving request: {err}")))?;
        Ok(request)
    }
}

/// Proof-free counterpart of an aggregation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub circuit: ProvingRequestType,
    pub children: [PublicInputs; 2],
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn child(tag: u8) -> ChildProof {
        ChildProof {
            public_inputs: PublicInputs(vec![tag]),
            proof: Proof(vec![tag, tag]),
            verification_key: VerificationKey(vec![1]),
            vk_witness: VkMembershipWitness {
                leaf_index: 0,
                sibling_path: vec![[0; 32]],
            },
        }
    }

    #[test]
    fn request_type_matches_variant() {
        for ty in ProvingRequestType::ALL {
            let request = if ty.is_aggregation() {
                ProvingRequest::aggregation(
                    ty,
                    AggregationInputs {
                        children: [child(1), child(2)],
                    },
                )
            } else {
                ProvingRequest::opaque(ty, OpaqueInputs(vec![7]))
            }
            .unwrap();
            assert_eq!(request.request_type(), ty);
        }
    }

    #[test]
    fn constructors_reject_mismatched_inputs() {
        assert_matches!(
            ProvingRequest::opaque(ProvingRequestType::MergeRollup, OpaqueInputs::default()),
            Err(ProvingError::Fatal(_))
        );
        assert_matches!(
            ProvingRequest::aggregation(
                ProvingRequestType::Tube,
                AggregationInputs {
                    children: [child(1), child(2)]
                }
            ),
            Err(ProvingError::Fatal(_))
        );
    }

    #[test]
    fn requests_survive_bincode() {
        let request = ProvingRequest::BlockMergeRollup(AggregationInputs {
            children: [child(3), child(4)],
        });
        let bytes = request.to_bytes().unwrap();
        assert_eq!(ProvingRequest::from_bytes(&bytes).unwrap(), request);
        assert_matches!(
            ProvingRequest::from_bytes(&[0xff, 0xff]),
            Err(ProvingError::Fatal(_))
        );
    }
}

//! Rolling BLAKE3 chain-of-custody proof over a cycle's layer tensors.
//! Each forward pass in secure mode folds the previous chain and every
//! non-empty layer tensor's bytes into a new digest; the chain advances to
//! equal that digest so successive passes form a hash chain that a second
//! runtime, seeded with the same previous chain, can independently verify.

use crate::tensor::Tensor;

/// Computes `BLAKE3(chain_prev ++ layer_tensors[0].bytes ++ layer_tensors[1].bytes ++ ...)`,
/// skipping empty tensors, and returns the lowercase hex digest.
pub fn compute_proof(chain_prev: &str, layer_tensors: &[Tensor]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(chain_prev.as_bytes());
    for t in layer_tensors {
        if !t.is_empty() {
            hasher.update(t.bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Rolling chain state carried by a runtime in secure mode.
#[derive(Clone, Debug, Default)]
pub struct ProofChain {
    /// The digest produced by the most recent forward pass, or empty before
    /// the first one.
    pub proof: String,
    /// The chain value fed into the next pass's digest; equals `proof`
    /// after every pass.
    pub chain: String,
}

impl ProofChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the chain from an externally received proof (used by the
    /// distributed scheduler to propagate proofs across partition
    /// boundaries) without altering `proof` itself.
    pub fn set_chain(&mut self, chain: impl Into<String>) {
        self.chain = chain.into();
    }

    /// Advances the chain after a forward pass, returning the new proof.
    pub fn advance(&mut self, layer_tensors: &[Tensor]) -> &str {
        let digest = compute_proof(&self.chain, layer_tensors);
        self.proof = digest;
        self.chain = self.proof.clone();
        &self.proof
    }

    /// Re-derives the digest against a supplied previous chain value and
    /// compares it to the stored proof.
    pub fn verify(&self, previous: &str, layer_tensors: &[Tensor]) -> bool {
        compute_proof(previous, layer_tensors) == self.proof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_layers_hash_just_the_previous_chain() {
        let mut chain = ProofChain::new();
        let proof = chain.advance(&[]).to_string();
        assert_eq!(proof, blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn skips_empty_tensors() {
        let mut chain = ProofChain::new();
        let full = Tensor::from_f32(vec![2], &[1.0, 2.0]);
        let empty = Tensor::empty();
        let with_empty = chain.advance(&[full.clone(), empty]).to_string();

        let mut chain2 = ProofChain::new();
        let without_empty = chain2.advance(&[full]).to_string();
        assert_eq!(with_empty, without_empty);
    }

    #[test]
    fn chains_across_two_passes_and_verifies() {
        let mut chain = ProofChain::new();
        let pass1 = vec![Tensor::from_f32(vec![1], &[1.0])];
        chain.advance(&pass1);
        let chain_after_pass_1 = chain.chain.clone();

        let pass2 = vec![Tensor::from_f32(vec![1], &[2.0])];
        chain.advance(&pass2);

        assert!(chain.verify(&chain_after_pass_1, &pass2));
        assert!(!chain.verify("wrong-previous", &pass2));
    }

    #[test]
    fn second_runtime_seeded_with_same_chain_verifies_independently() {
        let mut producer = ProofChain::new();
        let pass1 = vec![Tensor::from_f32(vec![1], &[1.0])];
        producer.advance(&pass1);

        let mut receiver = ProofChain::new();
        receiver.set_chain(producer.chain.clone());
        let pass2 = vec![Tensor::from_f32(vec![1], &[2.0])];
        receiver.advance(&pass2);

        let mut producer2 = producer.clone();
        producer2.advance(&pass2);

        assert_eq!(receiver.proof, producer2.proof);
    }
}

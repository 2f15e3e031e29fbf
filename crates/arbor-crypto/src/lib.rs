pub mod hash;
pub mod keypair;
pub mod vdf;
pub mod vrf;

pub use hash::{content_hash, keccak256};
pub use keypair::{recover_address, verify_signature, KeyPair};
pub use vdf::{draw_difficulty, solve_vdf, vdf_input, verify_vdf};
pub use vrf::{sortition_weight, vrf_prove, vrf_verify};

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "fuzzy", "gentle", "hollow", "icy", "jolly",
    "keen", "lucky", "misty", "nimble", "odd", "plucky", "quiet", "rusty", "sly", "tidy",
    "upbeat", "vivid", "wily", "young", "zesty",
];

const ANIMALS: &[&str] = &[
    "badger", "crane", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "jackal", "koala",
    "lemur", "marten", "newt", "otter", "puffin", "quail", "raven", "stoat", "tapir", "urchin",
    "vole", "walrus", "yak", "zebu",
];

/// A human-readable display name such as `misty-otter`.
pub fn random_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("plain");
    let animal = ANIMALS.choose(rng).copied().unwrap_or("peer");
    format!("{adjective}-{animal}")
}

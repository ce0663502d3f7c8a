#[macro_use]
extern crate criterion;

use criterion::Criterion;
use rand::{Rng, SeedableRng, XorShiftRng};

use twotower::data::{Interaction, Interactions, ItemFeatures, NUM_GENRES};
use twotower::models::{Architecture, Hyperparameters, TwoTowerModel};

const NUM_USERS: usize = 1000;
const NUM_ITEMS: usize = 2000;

fn synthetic_data(size: usize) -> Interactions {
    let mut rng = XorShiftRng::from_seed([7; 16]);
    let mut interactions = Interactions::new(NUM_USERS, NUM_ITEMS);

    for timestamp in 0..size {
        interactions.push(Interaction::new(
            rng.gen_range(0, NUM_USERS),
            rng.gen_range(0, NUM_ITEMS),
            1.0,
            timestamp,
        ));
    }

    interactions
}

fn build_model(architecture: Architecture) -> TwoTowerModel {
    let genres: Vec<Vec<usize>> = (0..NUM_ITEMS).map(|item| vec![item % NUM_GENRES]).collect();

    Hyperparameters::new(NUM_USERS, NUM_ITEMS)
        .architecture(architecture)
        .embedding_dim(32)
        .minibatch_size(64)
        .num_epochs(1)
        .from_seed([42; 16])
        .build()
        .with_item_features(ItemFeatures::from_genres(&genres).unwrap())
        .unwrap()
}

fn bench_fit(c: &mut Criterion) {
    let data = synthetic_data(10000).to_triplet();

    for &(name, architecture) in &[("fit_linear", Architecture::Linear), ("fit_deep", Architecture::Deep)] {
        let model = build_model(architecture);
        c.bench_function(name, |b| {
            b.iter(|| {
                model.fit(&data, |_| {}).unwrap();
            })
        });
    }
}

fn bench_score_all_items(c: &mut Criterion) {
    for &(name, architecture) in &[
        ("score_linear", Architecture::Linear),
        ("score_deep", Architecture::Deep),
    ] {
        let model = build_model(architecture);
        let user = model.user_embedding(0).unwrap();
        c.bench_function(name, |b| {
            b.iter(|| model.score_all_items(&user).unwrap())
        });
    }
}

criterion_group!{
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_fit, bench_score_all_items
}
criterion_main!(benches);

//! Train a linear and a deep two-tower model on the same synthetic
//! interactions and compare their loss curves, ranking quality and
//! recommendations.
//!
//! Users are assigned a favourite genre and mostly interact with items of
//! that genre, so both architectures have a clear signal to learn; only the
//! deep item tower sees the genres directly.
use std::path::PathBuf;

use clap::Parser;
use failure::Error;
use rand::distributions::{Distribution, Uniform};
use rand::{Rng, SeedableRng, XorShiftRng};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use twotower::config::TrainingConfig;
use twotower::data::{train_test_split, Interaction, Interactions, ItemFeatures, NUM_GENRES};
use twotower::evaluation::mrr_score;
use twotower::models::{Architecture, Hyperparameters, TwoTowerModel};

#[derive(Debug, Parser)]
#[command(name = "compare_towers", about = "Compare linear and deep two-tower models")]
struct Args {
    /// JSON training configuration; defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of synthetic users.
    #[arg(long, default_value_t = 500)]
    users: usize,
    /// Number of synthetic items.
    #[arg(long, default_value_t = 300)]
    items: usize,
    /// Interactions per user.
    #[arg(long, default_value_t = 30)]
    interactions_per_user: usize,
    /// Random seed for data generation and model initialization.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Number of recommendations to print per model.
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    /// Log every training step.
    #[arg(long, short)]
    verbose: bool,
}

fn seed_bytes(seed: u64) -> [u8; 16] {
    let mut bytes = [0x5e; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes
}

/// Each item gets a primary genre and, for every other item, a secondary one.
fn item_genres<R: Rng>(num_items: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let genre = Uniform::new(0, NUM_GENRES);

    (0..num_items)
        .map(|item_id| {
            let primary = item_id % NUM_GENRES;
            if item_id % 2 == 0 {
                vec![primary]
            } else {
                vec![primary, genre.sample(rng)]
            }
        })
        .collect()
}

/// Users interact with items of their favourite genre 80% of the time
/// and with uniformly random items otherwise.
fn synthetic_interactions<R: Rng>(
    num_users: usize,
    num_items: usize,
    per_user: usize,
    genres: &[Vec<usize>],
    rng: &mut R,
) -> Interactions {
    let mut by_genre = vec![Vec::new(); NUM_GENRES];
    for (item_id, item_genres) in genres.iter().enumerate() {
        by_genre[item_genres[0]].push(item_id);
    }

    let any_item = Uniform::new(0, num_items);
    let coin = Uniform::new(0.0f32, 1.0);
    let mut interactions = Interactions::new(num_users, num_items);

    for user_id in 0..num_users {
        let favourite = &by_genre[user_id % NUM_GENRES];

        for timestamp in 0..per_user {
            let item_id = if !favourite.is_empty() && coin.sample(rng) < 0.8 {
                favourite[rng.gen_range(0, favourite.len())]
            } else {
                any_item.sample(rng)
            };

            interactions.push(Interaction::new(user_id, item_id, 1.0, timestamp));
        }
    }

    interactions
}

fn train(
    architecture: Architecture,
    config: &TrainingConfig,
    seed: u64,
    train: &Interactions,
    features: &ItemFeatures,
) -> Result<(TwoTowerModel, Vec<f32>), Error> {
    let model = Hyperparameters::from_config(train.num_users(), train.num_items(), config)
        .architecture(architecture)
        .from_seed(seed_bytes(seed))
        .build()
        .with_item_features(features.clone())?;

    info!(?architecture, interactions = train.len(), "Training model");
    let mut epoch_losses = Vec::new();
    let mut loss_sum = 0.0;
    let loss = model.fit(&train.to_triplet(), |progress| {
        loss_sum += progress.loss;
        if progress.batch + 1 == progress.num_batches {
            epoch_losses.push(loss_sum / progress.num_batches as f32);
            loss_sum = 0.0;
        }
    })?;
    info!(?architecture, loss, steps = model.num_steps(), "Model trained");

    Ok((model, epoch_losses))
}

fn main() -> Result<(), Error> {
    let args = Args::parse();

    let directive = if args.verbose {
        "twotower=debug"
    } else {
        "twotower=info"
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config = match args.config {
        Some(ref path) => TrainingConfig::from_path(path)?,
        None => TrainingConfig::default(),
    };
    info!(?config, "Loaded configuration");

    let mut rng = XorShiftRng::from_seed(seed_bytes(args.seed));

    let genres = item_genres(args.items, &mut rng);
    let features = ItemFeatures::from_genres(&genres)?;
    let mut interactions = synthetic_interactions(
        args.users,
        args.items,
        args.interactions_per_user,
        &genres,
        &mut rng,
    );
    let (train_data, test_data) = train_test_split(&mut interactions, &mut rng, 0.2);
    info!(
        train = train_data.len(),
        test = test_data.len(),
        "Generated synthetic interactions"
    );

    let (linear, linear_losses) = train(Architecture::Linear, &config, args.seed, &train_data, &features)?;
    let (deep, deep_losses) = train(Architecture::Deep, &config, args.seed, &train_data, &features)?;

    println!("{:>6} {:>10} {:>10}", "epoch", "linear", "deep");
    for (epoch, (linear_loss, deep_loss)) in linear_losses.iter().zip(&deep_losses).enumerate() {
        println!("{:>6} {:>10.4} {:>10.4}", epoch, linear_loss, deep_loss);
    }

    println!(
        "{:>6} {:>10.4} {:>10.4}",
        "mrr",
        mrr_score(&linear, &train_data, &test_data)?,
        mrr_score(&deep, &train_data, &test_data)?
    );

    let user_id = 0;
    let seen: Vec<usize> = train_data
        .data()
        .iter()
        .filter(|interaction| interaction.user_id() == user_id)
        .map(|interaction| interaction.item_id())
        .collect();

    println!(
        "top {} for user {} (favourite genre {}):",
        args.top_k,
        user_id,
        user_id % NUM_GENRES
    );
    for (name, model) in &[("linear", &linear), ("deep", &deep)] {
        let recommended = model.recommend(user_id, args.top_k, &seen)?;
        let formatted: Vec<String> = recommended
            .iter()
            .map(|&(item_id, score)| format!("{}[{:?}]:{:.2}", item_id, genres[item_id], score))
            .collect();
        println!("{:>8} {}", name, formatted.join(" "));
    }

    Ok(())
}

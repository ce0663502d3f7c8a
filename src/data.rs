//! Interaction and item feature containers.
use std::hash::Hasher;

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use siphasher::sip::SipHasher;

use super::{EncodingError, ItemId, Timestamp, UserId};

/// Number of genre flags in the MovieLens item metadata.
pub const NUM_GENRES: usize = 19;

/// A single user-item interaction, with user and item ids already
/// mapped onto dense, zero-based indices.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    rating: f32,
    timestamp: Timestamp,
}

impl Interaction {
    /// Create a new interaction.
    pub fn new(user_id: UserId, item_id: ItemId, rating: f32, timestamp: Timestamp) -> Self {
        Interaction {
            user_id,
            item_id,
            rating,
            timestamp,
        }
    }

    /// The user index.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }
    /// The item index.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }
    /// The explicit rating. Training treats every interaction as
    /// a positive regardless of its rating.
    pub fn rating(&self) -> f32 {
        self.rating
    }
    /// The interaction timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Randomly split interactions into train and test sets. Fractions
/// outside `[0, 1]` put everything on one side.
pub fn train_test_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    interactions.shuffle(rng);

    let num_test = (test_fraction.max(0.0) * interactions.len() as f32) as usize;
    let num_test = num_test.min(interactions.len());
    let (test, train) = interactions.split_at(num_test);

    (train, test)
}

/// Split interactions so that every user's interactions land either
/// entirely in the train set or entirely in the test set.
pub fn user_based_split<R: Rng>(
    interactions: &mut Interactions,
    rng: &mut R,
    test_fraction: f32,
) -> (Interactions, Interactions) {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f32) as u64;

    let range = Uniform::new(0, u64::MAX);
    let (key_0, key_1) = (range.sample(rng), range.sample(rng));

    let is_train = |x: &Interaction| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_usize(x.user_id());
        hasher.finish() % denominator > train_cutoff
    };

    interactions.split_by(is_train)
}

/// A collection of interactions over a fixed user and item space.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Create an empty collection for the given user and item counts.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Add an interaction, growing the user and item spaces if needed.
    pub fn push(&mut self, interaction: Interaction) {
        self.num_users = self.num_users.max(interaction.user_id() + 1);
        self.num_items = self.num_items.max(interaction.item_id() + 1);
        self.interactions.push(interaction);
    }

    /// The underlying interactions.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Shuffle the interactions in place.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        rng.shuffle(&mut self.interactions);
    }

    /// Split into the first `idx` interactions and the rest.
    pub fn split_at(&self, idx: usize) -> (Self, Self) {
        let head = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[..idx].to_owned(),
        };
        let tail = Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions: self.interactions[idx..].to_owned(),
        };

        (head, tail)
    }

    /// Split into interactions for which `func` holds and the rest.
    pub fn split_by<F: Fn(&Interaction) -> bool>(&self, func: F) -> (Self, Self) {
        let (head, tail): (Vec<_>, Vec<_>) =
            self.interactions.iter().cloned().partition(|x| func(x));

        (
            Interactions {
                num_users: self.num_users,
                num_items: self.num_items,
                interactions: head,
            },
            Interactions {
                num_users: self.num_users,
                num_items: self.num_items,
                interactions: tail,
            },
        )
    }

    /// Convert to the columnar representation used for training.
    pub fn to_triplet(&self) -> TripletInteractions {
        TripletInteractions::from(self)
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(data: Vec<Interaction>) -> Interactions {
        let num_users = data.iter().map(|x| x.user_id() + 1).max().unwrap_or(0);
        let num_items = data.iter().map(|x| x.item_id() + 1).max().unwrap_or(0);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }
}

/// Columnar interactions, iterated in minibatches.
#[derive(Clone, Debug)]
pub struct TripletInteractions {
    num_users: usize,
    num_items: usize,
    user_ids: Vec<UserId>,
    item_ids: Vec<ItemId>,
}

impl TripletInteractions {
    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    /// Whether there are no interactions.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    /// Iterate over contiguous minibatches of at most `minibatch_size`
    /// interactions. The final minibatch holds whatever remains and
    /// may be shorter.
    pub fn iter_minibatch(&self, minibatch_size: usize) -> TripletMinibatchIterator {
        TripletMinibatchIterator {
            interactions: self,
            idx: 0,
            stop_idx: self.len(),
            minibatch_size: minibatch_size.max(1),
        }
    }

    /// Number of minibatches `iter_minibatch` yields.
    pub fn num_minibatches(&self, minibatch_size: usize) -> usize {
        let minibatch_size = minibatch_size.max(1);
        (self.len() + minibatch_size - 1) / minibatch_size
    }

    /// Return a copy with all columns permuted by the same random
    /// permutation.
    pub fn shuffled<R: Rng>(&self, rng: &mut R) -> TripletInteractions {
        let mut order: Vec<usize> = (0..self.len()).collect();
        rng.shuffle(&mut order);

        TripletInteractions {
            num_users: self.num_users,
            num_items: self.num_items,
            user_ids: order.iter().map(|&idx| self.user_ids[idx]).collect(),
            item_ids: order.iter().map(|&idx| self.item_ids[idx]).collect(),
        }
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

/// Iterator over minibatches of `TripletInteractions`.
#[derive(Clone, Debug)]
pub struct TripletMinibatchIterator<'a> {
    interactions: &'a TripletInteractions,
    idx: usize,
    stop_idx: usize,
    minibatch_size: usize,
}

/// A contiguous minibatch of interactions.
#[derive(Debug)]
pub struct TripletMinibatch<'a> {
    /// User indices.
    pub user_ids: &'a [UserId],
    /// Item indices.
    pub item_ids: &'a [ItemId],
}

impl<'a> TripletMinibatch<'a> {
    /// Number of interactions in the minibatch.
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    /// Whether the minibatch is empty.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }
}

impl<'a> Iterator for TripletMinibatchIterator<'a> {
    type Item = TripletMinibatch<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.stop_idx {
            return None;
        }

        let start = self.idx;
        let stop = (self.idx + self.minibatch_size).min(self.stop_idx);

        self.idx = stop;

        Some(TripletMinibatch {
            user_ids: &self.interactions.user_ids[start..stop],
            item_ids: &self.interactions.item_ids[start..stop],
        })
    }
}

impl<'a> From<&'a Interactions> for TripletInteractions {
    fn from(interactions: &'a Interactions) -> Self {
        let user_ids = interactions.data().iter().map(|x| x.user_id()).collect();
        let item_ids = interactions.data().iter().map(|x| x.item_id()).collect();

        TripletInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_ids,
            item_ids,
        }
    }
}

/// Dense, item-indexed side features (genre flags for MovieLens).
///
/// Every row has the same width; rows are looked up in constant time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemFeatures {
    num_features: usize,
    values: Vec<f32>,
}

impl ItemFeatures {
    /// Build from one feature row per item, in item index order.
    ///
    /// Fails with `DimensionMismatch` if any row is not `num_features` wide.
    pub fn new(num_features: usize, rows: Vec<Vec<f32>>) -> Result<Self, EncodingError> {
        let mut values = Vec::with_capacity(rows.len() * num_features);

        for row in rows {
            if row.len() != num_features {
                return Err(EncodingError::DimensionMismatch {
                    expected: num_features,
                    actual: row.len(),
                });
            }
            values.extend(row);
        }

        Ok(ItemFeatures {
            num_features,
            values,
        })
    }

    /// Build from MovieLens genre flags: one list of genre indices
    /// (each below `NUM_GENRES`) per item.
    pub fn from_genres(genres: &[Vec<usize>]) -> Result<Self, EncodingError> {
        let mut values = vec![0.0; genres.len() * NUM_GENRES];

        for (row, item_genres) in values.chunks_mut(NUM_GENRES).zip(genres) {
            for &genre in item_genres {
                if genre >= NUM_GENRES {
                    return Err(EncodingError::IndexOutOfRange {
                        index: genre,
                        bound: NUM_GENRES,
                    });
                }
                row[genre] = 1.0;
            }
        }

        Ok(ItemFeatures {
            num_features: NUM_GENRES,
            values,
        })
    }

    /// Features of `item_id`, if it is known.
    pub fn get(&self, item_id: ItemId) -> Option<&[f32]> {
        let start = item_id.checked_mul(self.num_features)?;
        self.values.get(start..start + self.num_features)
    }

    /// Width of every feature row.
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Number of items with features.
    pub fn num_items(&self) -> usize {
        if self.num_features == 0 {
            0
        } else {
            self.values.len() / self.num_features
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, XorShiftRng};

    use super::*;

    fn dummy_interactions() -> Interactions {
        let mut interactions = Vec::new();
        for user in 0..20 {
            for item in 0..5 {
                interactions.push(Interaction::new(user, item + user % 3, 4.0, item));
            }
        }

        Interactions::from(interactions)
    }

    #[test]
    fn shape_from_maxima() {
        let data = dummy_interactions();
        assert_eq!(data.shape(), (20, 7));
        assert_eq!(data.len(), 100);
    }

    #[test]
    fn minibatches_cover_all_interactions() {
        let data = dummy_interactions().to_triplet();

        let batches: Vec<_> = data.iter_minibatch(30).collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(data.num_minibatches(30), 4);
        assert_eq!(batches.last().unwrap().len(), 10);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), data.len());
    }

    #[test]
    fn shuffled_keeps_pairs_together() {
        let data = dummy_interactions().to_triplet();
        let mut rng = XorShiftRng::from_seed([42; 16]);
        let shuffled = data.shuffled(&mut rng);

        let mut original: Vec<_> = izip!(&data.user_ids, &data.item_ids).collect();
        let mut permuted: Vec<_> = izip!(&shuffled.user_ids, &shuffled.item_ids).collect();
        original.sort();
        permuted.sort();

        assert_eq!(original, permuted);
        assert_eq!(shuffled.shape(), data.shape());
    }

    #[test]
    fn split_fraction_is_clamped() {
        let mut rng = XorShiftRng::from_seed([42; 16]);

        let (train, test) = train_test_split(&mut dummy_interactions(), &mut rng, 0.2);
        assert_eq!((train.len(), test.len()), (80, 20));

        let (train, test) = train_test_split(&mut dummy_interactions(), &mut rng, 1.5);
        assert_eq!((train.len(), test.len()), (0, 100));
        assert_eq!(test.shape(), (20, 7));

        let (train, test) = train_test_split(&mut dummy_interactions(), &mut rng, -0.5);
        assert_eq!((train.len(), test.len()), (100, 0));
    }

    #[test]
    fn user_split_is_disjoint() {
        let mut data = dummy_interactions();
        let mut rng = XorShiftRng::from_seed([42; 16]);
        let (train, test) = user_based_split(&mut data, &mut rng, 0.5);

        assert_eq!(train.len() + test.len(), 100);
        for interaction in test.data() {
            assert!(train
                .data()
                .iter()
                .all(|x| x.user_id() != interaction.user_id()));
        }
    }

    #[test]
    fn item_features_validate_width() {
        let features = ItemFeatures::new(3, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 1.0]]).unwrap();
        assert_eq!(features.num_items(), 2);
        assert_eq!(features.get(1), Some(&[0.0, 1.0, 1.0][..]));
        assert_eq!(features.get(2), None);

        let err = ItemFeatures::new(3, vec![vec![1.0, 0.0]]).unwrap_err();
        assert_eq!(
            err,
            EncodingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn genre_flags() {
        let features = ItemFeatures::from_genres(&[vec![0, 18], vec![]]).unwrap();
        let first = features.get(0).unwrap();

        assert_eq!(first.len(), NUM_GENRES);
        assert_eq!(first[0], 1.0);
        assert_eq!(first[18], 1.0);
        assert_eq!(first.iter().sum::<f32>(), 2.0);
        assert!(features.get(1).unwrap().iter().all(|&x| x == 0.0));
        assert!(ItemFeatures::from_genres(&[vec![19]]).is_err());
    }
}

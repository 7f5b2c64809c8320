pub mod dao;
pub mod models;
pub mod toplist;

pub use dao::{Dao, PAGE_SIZE};
pub use models::{Article, Comment, CommentNode, Period, RankPair, Ranking, Story};
pub use toplist::TopList;

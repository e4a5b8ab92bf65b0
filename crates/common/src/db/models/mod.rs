//! SeaORM entity models
//!
//! Database entities for the generation pipeline

mod generation_attempt;
mod generation_job;
mod study_card;

pub use generation_job::{
    Entity as GenerationJobEntity,
    Model as GenerationJobRow,
    ActiveModel as GenerationJobActiveModel,
    Column as GenerationJobColumn,
};

pub use generation_attempt::{
    Entity as GenerationAttemptEntity,
    Model as GenerationAttemptRow,
    ActiveModel as GenerationAttemptActiveModel,
    Column as GenerationAttemptColumn,
};

pub use study_card::{
    Entity as StudyCardEntity,
    Model as StudyCardRow,
    ActiveModel as StudyCardActiveModel,
    Column as StudyCardColumn,
};

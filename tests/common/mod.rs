#![allow(dead_code)]

use bpsync::{
    config::ProgramConfig, BThreadContext, BehaviorError, BehaviorResult, Declaration, Event,
    EventSet, Program,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub const VISCOSITY: &str = "VISCOSITY";
pub const ADD_DRY: &str = "ADD_DRY";
pub const ADD_WET: &str = "ADD_WET";

pub fn additions() -> EventSet {
    EventSet::names([ADD_DRY, ADD_WET])
}

/// Blocks ADD_DRY while the last reading is strictly above `bound` and ADD_WET
/// while it is strictly below `-bound`, until an addition happens.
pub async fn viscosity_limiter(mut ctx: BThreadContext, bound: i64) -> BehaviorResult {
    loop {
        let reading = ctx.wait_for(VISCOSITY).await?;
        let value = reading
            .payload()
            .as_i64()
            .ok_or_else(|| BehaviorError::failed("reading without a value"))?;
        let mut blocked = Vec::new();
        if value > bound {
            blocked.push(ADD_DRY);
        }
        if value < -bound {
            blocked.push(ADD_WET);
        }
        ctx.sync(
            Declaration::new()
                .wait_for(additions())
                .block(EventSet::names(blocked)),
        )
        .await?;
    }
}

/// Reports one reading, then waits for an addition.
pub async fn sensor(mut ctx: BThreadContext, reading: i64) -> BehaviorResult {
    ctx.request(Event::with_payload(VISCOSITY, reading)).await?;
    ctx.wait_for(additions()).await?;
    Ok(())
}

/// After the reading, requests each of `proposals` as alternatives.
pub async fn mixer(mut ctx: BThreadContext, proposals: Vec<&'static str>) -> BehaviorResult {
    ctx.wait_for(VISCOSITY).await?;
    ctx.sync(Declaration::new().requests(proposals.into_iter().map(Event::new)))
        .await?;
    Ok(())
}

pub fn viscosity_program(reading: i64, bound: i64, proposals: Vec<&'static str>) -> Program {
    let mut program = Program::new(&ProgramConfig::default());
    program
        .register_behavior("Sensor", move |ctx| sensor(ctx, reading))
        .unwrap();
    program
        .register_behavior("Mixer", move |ctx| mixer(ctx, proposals))
        .unwrap();
    program
        .register_behavior("ViscosityLimiter", move |ctx| viscosity_limiter(ctx, bound))
        .unwrap();
    program
}

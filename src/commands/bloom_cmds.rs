//! Bloom filter command implementations.
//!
//! BF.* commands over the scalable [`BloomObject`]. Argument positions below
//! are relative to the command name (`args[0]` is the key).

use super::{
    ADD_EVENT, CallContext, KeyspaceEvent, Origin, Outcome, ParsedCommand, RESERVE_EVENT,
};
use crate::Result;
use crate::error::{BloomError, CommandError, Error};
use crate::persistence::codec;
use crate::protocol::Frame;
use crate::server::replication::{Propagation, creation_command};
use crate::storage::Db;
use crate::types::ViatorValue;
use crate::types::bloom::{
    BloomObject, BloomOptions, SEED_LEN, Scaling, SeedChoice, SizeLimit,
};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Outcome>> + Send>>;

/// Limit applied to this call. Replicated writes already passed it on the primary.
fn size_limit(ctx: &CallContext) -> SizeLimit {
    if ctx.is_replicated() {
        SizeLimit::unchecked(ctx.config.bloom_memory_limit)
    } else {
        SizeLimit::enforced(ctx.config.bloom_memory_limit)
    }
}

/// Creation parameters taken from the configured defaults.
///
/// A replicated creation carries SEED whenever the primary drew one, so
/// without it the object is fixed-seed whatever the local setting says.
fn default_options(ctx: &CallContext) -> BloomOptions {
    let config = &ctx.config;
    BloomOptions {
        capacity: config.bloom_capacity,
        fp_rate: config.bloom_fp_rate,
        tightening_ratio: config.bloom_tightening_ratio,
        scaling: Scaling::from_expansion(config.bloom_expansion),
        seed: if config.bloom_use_random_seed && !ctx.is_replicated() {
            SeedChoice::Random
        } else {
            SeedChoice::Fixed
        },
    }
}

fn parse_fp_rate(arg: &[u8]) -> std::result::Result<f64, CommandError> {
    match std::str::from_utf8(arg).ok().and_then(|s| s.parse::<f64>().ok()) {
        Some(rate) if rate > 0.0 && rate < 1.0 => Ok(rate),
        Some(_) => Err(CommandError::ErrorRateRange),
        None => Err(BloomError::BadErrorRate.into()),
    }
}

fn parse_tightening(arg: &[u8]) -> std::result::Result<f64, CommandError> {
    match std::str::from_utf8(arg).ok().and_then(|s| s.parse::<f64>().ok()) {
        Some(ratio) if ratio > 0.0 && ratio < 1.0 => Ok(ratio),
        Some(_) => Err(CommandError::TighteningRatioRange),
        None => Err(BloomError::BadTighteningRatio.into()),
    }
}

fn parse_capacity(arg: &[u8]) -> std::result::Result<i64, CommandError> {
    match std::str::from_utf8(arg).ok().and_then(|s| s.parse::<i64>().ok()) {
        Some(capacity) if capacity >= 1 => Ok(capacity),
        Some(0) => Err(CommandError::CapacityZero),
        _ => Err(BloomError::BadCapacity.into()),
    }
}

fn parse_expansion(arg: &[u8]) -> std::result::Result<u32, CommandError> {
    match std::str::from_utf8(arg).ok().and_then(|s| s.parse::<u32>().ok()) {
        Some(expansion) if expansion >= 1 => Ok(expansion),
        _ => Err(BloomError::BadExpansion.into()),
    }
}

fn parse_seed(arg: &[u8]) -> std::result::Result<[u8; SEED_LEN], CommandError> {
    <[u8; SEED_LEN]>::try_from(arg).map_err(|_| BloomError::InvalidSeed.into())
}

/// Results of adding a run of items to one object.
#[derive(Debug, Default)]
struct AddBatch {
    /// One reply per attempted item, plus the error that stopped the run
    replies: Vec<Frame>,
    /// Items that were genuinely new
    added: Vec<Bytes>,
    /// Items processed before the run stopped
    processed: usize,
    /// Error that stopped the run
    error: Option<BloomError>,
}

fn add_batch(bloom: &mut BloomObject, items: &[Bytes], limit: SizeLimit) -> AddBatch {
    let mut batch = AddBatch {
        replies: Vec::with_capacity(items.len()),
        ..AddBatch::default()
    };
    for item in items {
        match bloom.add_item(item, limit) {
            Ok(added) => {
                if added {
                    batch.added.push(item.clone());
                }
                batch.replies.push(Frame::boolean(added));
                batch.processed += 1;
            }
            Err(e) => {
                batch.replies.push(Frame::error(e.to_string()));
                batch.error = Some(e);
                break;
            }
        }
    }
    batch
}

/// Decide propagation and events for a write that added `batch` to `key`.
///
/// `item_start` is the index in `cmd.args` of the first item.
fn write_effects(
    cmd: &ParsedCommand,
    key: &Bytes,
    bloom: &BloomObject,
    created: bool,
    batch: &AddBatch,
    item_start: usize,
) -> (Propagation, Vec<KeyspaceEvent>) {
    let mut events = Vec::new();
    if created {
        events.push(KeyspaceEvent {
            event: RESERVE_EVENT,
            key: key.clone(),
        });
    }
    if !batch.added.is_empty() {
        events.push(KeyspaceEvent {
            event: ADD_EVENT,
            key: key.clone(),
        });
    }

    let propagation = if created {
        Propagation::Rewritten(creation_command(key, bloom, &batch.added))
    } else if batch.added.is_empty() {
        Propagation::None
    } else if batch.error.is_none() {
        Propagation::Verbatim(cmd.to_argv())
    } else {
        // Forward only the items the primary got through
        let mut argv = cmd.to_argv();
        argv.truncate(1 + item_start + batch.processed);
        Propagation::Rewritten(argv)
    };
    (propagation, events)
}

/// Add `items` to the object under `key`, creating it with `options` if absent.
fn add_or_create(
    cmd: &ParsedCommand,
    db: &Db,
    ctx: &CallContext,
    options: BloomOptions,
    validate_scale_to: Option<i64>,
    nocreate: bool,
    item_start: usize,
) -> Result<(AddBatch, Propagation, Vec<KeyspaceEvent>)> {
    let key = cmd.args[0].clone();
    let items = &cmd.args[item_start..];
    let limit = size_limit(ctx);

    db.with_bloom_or_create(
        key.clone(),
        || -> Result<BloomObject> {
            if nocreate {
                return Err(CommandError::NotFound.into());
            }
            BloomObject::new(options, validate_scale_to, limit, db.metrics()).map_err(Error::from)
        },
        |bloom, created| {
            let batch = add_batch(bloom, items, limit);
            let (propagation, events) =
                write_effects(cmd, &key, bloom, created, &batch, item_start);
            (batch, propagation, events)
        },
    )
}

/// BF.ADD key item
/// Add an item, creating the filter with default parameters if needed.
pub fn cmd_bf_add(cmd: ParsedCommand, db: Arc<Db>, ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let options = default_options(&ctx);
        let (batch, propagation, events) = add_or_create(&cmd, &db, &ctx, options, None, false, 1)?;
        if let Some(e) = batch.error {
            return Err(e.into());
        }
        Ok(Outcome {
            frame: Frame::boolean(!batch.added.is_empty()),
            propagation,
            events,
        })
    })
}

/// BF.MADD key item [item ...]
/// Add items, creating the filter with default parameters if needed.
pub fn cmd_bf_madd(cmd: ParsedCommand, db: Arc<Db>, ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let options = default_options(&ctx);
        let (batch, propagation, events) = add_or_create(&cmd, &db, &ctx, options, None, false, 1)?;
        Ok(Outcome {
            frame: Frame::Array(batch.replies),
            propagation,
            events,
        })
    })
}

/// BF.INSERT key [CAPACITY n] [ERROR p] [EXPANSION n] [NOCREATE] [NONSCALING]
///           [TIGHTENING r] [SEED s] [VALIDATESCALETO n] [ITEMS item ...]
/// Add items with explicit creation parameters.
pub fn cmd_bf_insert(cmd: ParsedCommand, db: Arc<Db>, ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let mut options = default_options(&ctx);
        let mut nocreate = false;
        let mut validate_scale_to = None;
        let mut idx = 1;
        let argc = cmd.arg_count();

        while idx < argc {
            let option = cmd.get_str(idx)?.to_uppercase();
            if option == "ITEMS" {
                idx += 1;
                if idx == argc {
                    return Err(cmd.wrong_arity().into());
                }
                break;
            }
            match option.as_str() {
                "NOCREATE" => nocreate = true,
                "NONSCALING" => options.scaling = Scaling::NonScaling,
                _ => {
                    // Every remaining option takes a value
                    let value = cmd.get_arg(idx + 1).ok_or_else(|| cmd.wrong_arity())?;
                    match option.as_str() {
                        "ERROR" => options.fp_rate = parse_fp_rate(value)?,
                        "CAPACITY" => options.capacity = parse_capacity(value)?,
                        "EXPANSION" => {
                            options.scaling = Scaling::Expansion(parse_expansion(value)?)
                        }
                        "TIGHTENING" => options.tightening_ratio = parse_tightening(value)?,
                        "SEED" => options.seed = SeedChoice::Drawn(parse_seed(value)?),
                        "VALIDATESCALETO" => validate_scale_to = Some(parse_capacity(value)?),
                        _ => return Err(CommandError::UnknownArgument.into()),
                    }
                    idx += 1;
                }
            }
            idx += 1;
        }

        if validate_scale_to.is_some() && !options.scaling.is_scaling() {
            return Err(BloomError::NonScalingWithValidateScaleTo.into());
        }

        let item_start = idx.min(argc);
        let (batch, propagation, events) = add_or_create(
            &cmd,
            &db,
            &ctx,
            options,
            validate_scale_to,
            nocreate,
            item_start,
        )?;
        Ok(Outcome {
            frame: Frame::Array(batch.replies),
            propagation,
            events,
        })
    })
}

/// BF.EXISTS key item
/// Check whether an item may be in the filter.
pub fn cmd_bf_exists(cmd: ParsedCommand, db: Arc<Db>, _ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let exists = db
            .with_bloom(&cmd.args[0], |bloom| bloom.item_exists(&cmd.args[1]))?
            .unwrap_or(false);
        Ok(Outcome::reply(Frame::boolean(exists)))
    })
}

/// BF.MEXISTS key item [item ...]
/// Check several items; an absent key reports all zeros.
pub fn cmd_bf_mexists(cmd: ParsedCommand, db: Arc<Db>, _ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let items = &cmd.args[1..];
        let results = db
            .with_bloom(&cmd.args[0], |bloom| {
                items
                    .iter()
                    .map(|item| Frame::boolean(bloom.item_exists(item)))
                    .collect::<Vec<_>>()
            })?
            .unwrap_or_else(|| vec![Frame::Integer(0); items.len()]);
        Ok(Outcome::reply(Frame::Array(results)))
    })
}

/// BF.CARD key
/// Number of items added; 0 for an absent key.
pub fn cmd_bf_card(cmd: ParsedCommand, db: Arc<Db>, _ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let card = db
            .with_bloom(&cmd.args[0], BloomObject::cardinality)?
            .unwrap_or(0);
        Ok(Outcome::reply(Frame::Integer(card)))
    })
}

/// BF.RESERVE key error_rate capacity [EXPANSION expansion | NONSCALING]
/// Create an empty filter.
pub fn cmd_bf_reserve(cmd: ParsedCommand, db: Arc<Db>, ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let argc = cmd.arg_count();
        let mut options = default_options(&ctx);
        options.fp_rate = parse_fp_rate(&cmd.args[1])?;
        options.capacity = parse_capacity(&cmd.args[2])?;

        if argc > 3 {
            match cmd.get_str(3)?.to_uppercase().as_str() {
                "NONSCALING" if argc == 4 => options.scaling = Scaling::NonScaling,
                "EXPANSION" if argc == 5 => {
                    options.scaling = Scaling::Expansion(parse_expansion(&cmd.args[4])?)
                }
                _ => return Err(cmd.wrong_arity().into()),
            }
        }

        let key = cmd.args[0].clone();
        let limit = size_limit(&ctx);
        let created = db.with_bloom_or_create(
            key.clone(),
            || BloomObject::new(options, None, limit, db.metrics()).map_err(Error::from),
            |bloom, created| created.then(|| creation_command(&key, bloom, &[])),
        )?;
        let Some(canonical) = created else {
            return Err(CommandError::ItemExists.into());
        };

        Ok(Outcome {
            frame: Frame::ok(),
            propagation: Propagation::Rewritten(canonical),
            events: vec![KeyspaceEvent {
                event: RESERVE_EVENT,
                key,
            }],
        })
    })
}

/// BF.INFO key [CAPACITY | SIZE | FILTERS | ITEMS | ERROR | EXPANSION |
///              TIGHTENING | MAXSCALEDCAPACITY]
/// Report filter attributes.
pub fn cmd_bf_info(cmd: ParsedCommand, db: Arc<Db>, _ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let field = match cmd.get_arg(1) {
            Some(_) => Some(cmd.get_str(1)?.to_uppercase()),
            None => None,
        };
        let frame = db
            .with_bloom(&cmd.args[0], |bloom| match field.as_deref() {
                None => Ok(info_all(bloom)),
                Some(field) => info_field(bloom, field),
            })?
            .ok_or(CommandError::NotFound)??;
        Ok(Outcome::reply(frame))
    })
}

fn expansion_frame(bloom: &BloomObject) -> Frame {
    match bloom.scaling() {
        Scaling::NonScaling => Frame::Null,
        Scaling::Expansion(n) => Frame::Integer(i64::from(n)),
    }
}

fn info_all(bloom: &BloomObject) -> Frame {
    let mut fields = vec![
        Frame::simple("Capacity"),
        Frame::Integer(bloom.capacity()),
        Frame::simple("Size"),
        Frame::Integer(bloom.memory_usage() as i64),
        Frame::simple("Number of filters"),
        Frame::Integer(bloom.num_filters() as i64),
        Frame::simple("Number of items inserted"),
        Frame::Integer(bloom.cardinality()),
        Frame::simple("Error rate"),
        Frame::bulk(bloom.fp_rate().to_string()),
        Frame::simple("Expansion rate"),
        expansion_frame(bloom),
        Frame::simple("Tightening ratio"),
        Frame::bulk(bloom.tightening_ratio().to_string()),
    ];
    if bloom.scaling().is_scaling() {
        fields.push(Frame::simple("Max scaled capacity"));
        fields.push(Frame::Integer(bloom.max_scaled_capacity()));
    }
    Frame::Array(fields)
}

fn info_field(bloom: &BloomObject, field: &str) -> std::result::Result<Frame, CommandError> {
    Ok(match field {
        "CAPACITY" => Frame::Integer(bloom.capacity()),
        "SIZE" => Frame::Integer(bloom.memory_usage() as i64),
        "FILTERS" => Frame::Integer(bloom.num_filters() as i64),
        "ITEMS" => Frame::Integer(bloom.cardinality()),
        "ERROR" => Frame::bulk(bloom.fp_rate().to_string()),
        "EXPANSION" => expansion_frame(bloom),
        "TIGHTENING" => Frame::bulk(bloom.tightening_ratio().to_string()),
        "MAXSCALEDCAPACITY" if bloom.scaling().is_scaling() => {
            Frame::Integer(bloom.max_scaled_capacity())
        }
        "MAXSCALEDCAPACITY" => Frame::Null,
        _ => return Err(CommandError::InvalidInfoValue),
    })
}

/// BF.LOAD key data
/// Restore a filter from its serialized form.
pub fn cmd_bf_load(cmd: ParsedCommand, db: Arc<Db>, ctx: CallContext) -> HandlerFuture {
    Box::pin(async move {
        let key = cmd.args[0].clone();
        if db.exists(&key) {
            return Err(CommandError::BusyKey.into());
        }

        // An object replayed from the AOF is persisted state and must fit
        // this server's limit
        let bloom = if ctx.origin == Origin::AofLoad {
            let limit = SizeLimit::enforced(ctx.config.bloom_memory_limit);
            codec::decode_persisted(&key, &cmd.args[1], limit, db.metrics())?
        } else {
            codec::decode(&cmd.args[1], size_limit(&ctx), db.metrics())?
        };
        if !db.set_nx(key.clone(), ViatorValue::Bloom(bloom)) {
            return Err(CommandError::BusyKey.into());
        }

        Ok(Outcome {
            frame: Frame::ok(),
            propagation: Propagation::Verbatim(cmd.to_argv()),
            events: vec![KeyspaceEvent {
                event: RESERVE_EVENT,
                key,
            }],
        })
    })
}

//! Connects to a radio, prints what it reports and dumps a few seconds of
//! meter frames.
//!
//! ```text
//! cargo run --example probe -- 192.168.1.40:4992
//! cargo run --example probe            # against a scripted in-process radio
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use radiolink::e2e_common::{RadioScript, ScriptedRadio};
use radiolink::stream::{encode_datagram, encode_meters};
use radiolink::{
    BuildInfo, FrameKind, FramePayload, MemoryTransport, MeterReading, RadioClient, SessionConfig,
    StatusEvent, StreamFrame,
};

const METER_STREAM: u16 = 0x0700;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let target: Option<SocketAddr> = std::env::args().nth(1).map(|a| a.parse()).transpose()?;
    match target {
        Some(addr) => probe(RadioClient::open(addr).await?).await,
        None => probe_scripted().await,
    }
}

async fn probe_scripted() -> Result<(), Box<dyn Error>> {
    let (transport, radio) = MemoryTransport::pair();
    let script = RadioScript::new()
        .greet("V1.4.0.0")
        .greet("H5F3A0001")
        .reply("info", 0, r#"model="FLEX-6400",name="bench",callsign=N0CALL"#)
        .reply("version", 0, "SmartSDR-MB=3.4.23#PSoC-MBTRX=1.00")
        .reply("radio uptime", 0, "3600")
        .reply("ant list", 0, "ANT1,ANT2");
    let mut radio = ScriptedRadio::spawn(radio, script);

    let config = SessionConfig {
        keepalive: false,
        ..SessionConfig::default()
    };
    let client = RadioClient::open_with(
        "127.0.0.1:4992".parse()?,
        config,
        BuildInfo::current(),
        &transport,
    )
    .await?;

    let injector = radio
        .datagram_endpoint()
        .await
        .ok_or("scripted radio stopped")?;
    tokio::spawn(async move {
        for sequence in 1..=20u32 {
            if sequence == 5 {
                radio.push_line("Sradio|slices=2 panadapters=1");
            }
            let reading = MeterReading { meter_id: 1, raw: (sequence as i16) * 128 };
            let Ok(datagram) =
                encode_datagram(METER_STREAM, FrameKind::Meter, sequence, &encode_meters(&[reading]))
            else {
                break;
            };
            if injector.send(datagram).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
    probe(client).await
}

async fn probe(client: RadioClient) -> Result<(), Box<dyn Error>> {
    let identity = client.identity();
    println!(
        "connected: handle={} version={}",
        identity.handle.as_deref().unwrap_or("-"),
        identity.version.as_deref().unwrap_or("-")
    );
    for (key, value) in client.info().await? {
        println!("info    {key} = {value}");
    }
    for (key, value) in client.version().await? {
        println!("version {key} = {value}");
    }
    println!("uptime  {}s", client.uptime().await?);
    println!("antennas {:?}", client.antenna_list().await?);

    client
        .subscribe("radio", |event: &StatusEvent| -> Result<(), String> {
            println!("status  {} {:?}", event.category, event.pairs);
            Ok(())
        })
        .await?;

    let (tx, mut frames) = mpsc::unbounded_channel::<StreamFrame>();
    client.register_stream_consumer(METER_STREAM, tx).await?;
    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = frames.recv() => match frame {
                Some(StreamFrame { sequence, payload: FramePayload::Meters(readings), .. }) => {
                    for reading in readings {
                        println!("meter   #{sequence} id={} raw={}", reading.meter_id, reading.raw);
                    }
                }
                Some(frame) => println!("frame   {} {} entries", frame.kind, frame.payload.len()),
                None => break,
            },
        }
    }

    let stats = client.stream_stats();
    println!(
        "streams: frames={} malformed={} lost={}",
        stats.frames, stats.malformed, stats.lost
    );
    client.close().await;
    Ok(())
}

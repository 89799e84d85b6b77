//! Subscribe to a channel on a Centrifugo server.
//!
//! ```sh
//! cargo run -p centrifuge-client --example subscribe -- <URL> <CHANNEL>
//! ```
//!
//! The connection token is read from `CENTRIFUGO_TOKEN` when set, e.g.:
//! ```sh
//! CENTRIFUGO_TOKEN=eyJ... cargo run -p centrifuge-client --example subscribe \
//!     -- ws://localhost:8000/connection/websocket news
//! ```
//!
//! Publication data is printed to stdout (pipe to `jq` for formatting).

use centrifuge_client::{Client, ClientConfig, ClientEvent, SubscriptionConfig, SubscriptionEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let url = args.first().ok_or("usage: subscribe <URL> <CHANNEL>")?;
    let channel = args.get(1).ok_or("usage: subscribe <URL> <CHANNEL>")?;

    let config = ClientConfig {
        token: std::env::var("CENTRIFUGO_TOKEN").ok(),
        name: "centrifuge-client-example".into(),
        ..Default::default()
    };
    let (client, mut events) = Client::websocket(url, config)?;
    let (sub, mut sub_events) = client.new_subscription(channel, SubscriptionConfig::default())?;

    eprintln!("subscribing to '{channel}' ...");
    sub.subscribe();
    client.connect();

    loop {
        tokio::select! {
            Some(event) = events.next() => match event {
                ClientEvent::Connecting { code, reason } => {
                    eprintln!("[connecting] code={code} {reason}");
                }
                ClientEvent::Connected { client_id } => eprintln!("[connected] client={client_id}"),
                ClientEvent::Disconnected { code, reason, reconnect } => {
                    eprintln!("[disconnected] code={code} {reason}");
                    if !reconnect {
                        break;
                    }
                }
                ClientEvent::Error(e) => eprintln!("[error] {e}"),
                other => eprintln!("[event] {other:?}"),
            },
            Some(event) = sub_events.next() => match event {
                SubscriptionEvent::Publication(p) => {
                    eprintln!("[publication] offset={}", p.offset);
                    println!("{}", p.data);
                }
                SubscriptionEvent::Subscribed { recovered, .. } => {
                    eprintln!("[subscribed] recovered={recovered}");
                }
                SubscriptionEvent::SubscribeError { code, message } => {
                    eprintln!("[subscribe error] code={code} {message}");
                    break;
                }
                other => eprintln!("[subscription] {other:?}"),
            },
            else => break,
        }
    }

    Ok(())
}

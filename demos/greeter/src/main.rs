//! A minimal end-to-end walkthrough: one context hosts a `greeter` service,
//! a local proxy calls it, and a subscriber receives the signal the service
//! publishes on every greeting. Run with `cargo run -p greeter-demo`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::address::Address;
use conduit_core::config::ContextConfig;
use conduit_core::value::Value;
use conduit_runtime::{ClosureService, Context, SignalReceiver};

fn main() {
    tracing_subscriber::fmt::init();

    let config = ContextConfig::new("greeter-host", "demo-lab").with_bind_port(0);
    let context = Context::start(config).expect("failed to start context");

    let service_address = context
        .register_service(
            "greeter",
            Box::new(ClosureService::new().method("greet", |args, _kwargs, publish| {
                let name = args.first().and_then(Value::as_str).unwrap_or("stranger").to_owned();
                let greeting = format!("Hello, {name}!");
                publish.publish("greeted", Value::Str(name));
                Ok(Value::Str(greeting))
            })),
        )
        .expect("failed to register the greeter service");

    let subscriber_address = Address::new(context.local_context(), "greeting-listener").expect("valid address");
    let receiver = Arc::new(SignalReceiver::new(16));
    context.router().register_handler(subscriber_address.clone(), receiver.clone());
    context.subscribe(service_address.clone(), "greeted", subscriber_address);

    let greeter = context.proxy(service_address);
    let reply = greeter
        .call("greet", vec![Value::Str("Ada".into())], BTreeMap::new())
        .expect("greet call failed");
    println!("{}", reply.as_str().unwrap_or("<non-string reply>"));

    if let Some(name) = receiver.pop_with_timeout(Duration::from_secs(1)) {
        println!("observed signal: greeted({name:?})");
    } else {
        println!("no signal observed within the timeout");
    }

    context.shutdown();
}

use carrot_topic::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use carrot_topic::config::{MapConfig, DEFAULT_SECTION};
use carrot_topic::consumers::{ClosureCallback, Message, Payload};
use carrot_topic::{get_connection_pool, ConnectionContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // First of all we build the configuration for our connection factory.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let connection_factory = ConnectionFactory::new_from_config(&settings)?;

    // Connections are pooled. The size of the pool comes from `pool_size` in the `rabbitmq`
    // section of the configuration, the broker URL and the exchange consumers bind to from the
    // section we pass along.
    // There is one pool per broker type in the whole process: asking again for a pool of
    // `ConnectionFactory` connections gives you this same pool back.
    let config = MapConfig::new()
        .with(DEFAULT_SECTION, "pool_size", "4")
        .with(DEFAULT_SECTION, "url", settings.amqp_url()?.expose_secret().as_str())
        .with(DEFAULT_SECTION, "exchange", "demo-exchange");
    let pool = get_connection_pool(&config, connection_factory, DEFAULT_SECTION)?;

    // A context borrows a connection from the pool until it is closed.
    // If every connection is taken, this waits for one to be given back.
    let mut context = ConnectionContext::pooled(&pool).await?;

    // Each consumer declares a queue named after its topic and binds it to the exchange.
    // Topics follow the AMQP wildcard rules: `*` stands for one word, `#` for any number of words.
    //
    // Messages are acknowledged once the callback is done, even if it fails: returning an error
    // (or panicking) only gets logged.
    context
        .create_consumer(
            "orders.*",
            ClosureCallback(|message: Message| async move {
                match &message.payload {
                    Payload::Json(order) => println!("[{}] {order}", message.routing_key),
                    _ => anyhow::bail!("Orders are expected to be JSON"),
                }
                Ok(())
            }),
        )
        .await?;
    context
        .create_consumer(
            "audit.#",
            ClosureCallback(|message: Message| async move {
                println!("[{}] {:?}", message.routing_key, message.text());
                Ok::<_, anyhow::Error>(())
            }),
        )
        .await?;

    // Deliveries are drained on a background task: we get a handle back straight away.
    let mut drain = context.consume_in_thread().await?;
    println!("Consuming, press Ctrl-C to stop");

    loop {
        let interrupted = tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = drain.finished() => false,
        };
        if interrupted {
            break;
        }
        // The broker went away: reconnect, keeping our consumers.
        // There is no retry policy here: if the broker is still down, we give up.
        context.recover().await?;
        match context.connection()?.drain_handle() {
            Some(handle) => drain = handle,
            None => break,
        }
    }

    // Closing stops the drain loop, cancels the consumers and gives the connection back.
    context.close().await?;
    Ok(())
}
